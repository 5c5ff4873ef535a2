use snafu::ResultExt;

use crate::crypto::keyset::KeyProvider;
use crate::crypto::{sha256, AesKey, AesXtsKey};
use crate::hexstring::HexData;

use super::structs::{NcaHeader, NcaKeyArea, NcaMagic};
use super::{MissingKeySnafu, NcaError};

/// SHA-256 of the well-known plaintext key area some NCA0 archives carry
/// instead of an encrypted one.
pub(crate) const NCA0_PLAINTEXT_KEY_AREA_HASH: [u8; 0x20] = [
    0x9A, 0xBB, 0xD2, 0x11, 0x86, 0x00, 0x21, 0x9D, 0x7A, 0xDC, 0x5B, 0x43, 0x95, 0xF8, 0x4E,
    0xFD, 0xFF, 0x6B, 0x25, 0xEF, 0x9F, 0x96, 0x85, 0x28, 0x18, 0x9E, 0x76, 0xB0, 0x92, 0xF0,
    0x6A, 0xCB,
];

/// NCA0 only carries the XTS pair; later formats use all four slots.
fn key_slot_count(version: NcaMagic) -> usize {
    match version {
        NcaMagic::Nca0 => 2,
        _ => 4,
    }
}

/// The decrypted key area of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyArea {
    slots: [AesKey; 4],
    /// Set when the stored key area was recognized as plaintext (NCA0); the
    /// encrypt side then copies it back verbatim.
    plaintext: bool,
}

impl KeyArea {
    pub(crate) const ZERO: Self = KeyArea {
        slots: [AesKey::ZERO; 4],
        plaintext: false,
    };

    pub fn slot(&self, index: usize) -> AesKey {
        self.slots[index]
    }

    /// XTS key pair from slots 0 and 1.
    pub fn xts_key(&self) -> AesXtsKey {
        AesXtsKey::from_slots(*self.slots[0].as_bytes(), *self.slots[1].as_bytes())
    }

    /// Working key for CTR sections. CTR-Ex sections are keyed from this slot
    /// as well; slot 3 is carried but never selected.
    pub fn ctr_key(&self) -> AesKey {
        self.slots[2]
    }

    pub(crate) fn set_ctr_key(&mut self, key: AesKey) {
        self.slots[2] = key;
    }

    #[cfg(test)]
    pub(crate) fn from_slots(slots: [AesKey; 4], plaintext: bool) -> Self {
        KeyArea { slots, plaintext }
    }
}

pub(crate) fn decrypt_key_area(
    keys: &dyn KeyProvider,
    header: &NcaHeader,
    key_generation: u8,
) -> Result<KeyArea, NcaError> {
    let raw = &header.encrypted_key_area;

    if header.magic == NcaMagic::Nca0 && sha256(&raw.to_bytes()) == NCA0_PLAINTEXT_KEY_AREA_HASH {
        let mut slots = [AesKey::ZERO; 4];
        for (slot, stored) in slots.iter_mut().zip(raw.slots.iter()) {
            *slot = AesKey::from(stored.0);
        }
        return Ok(KeyArea {
            slots,
            plaintext: true,
        });
    }

    let count = key_slot_count(header.magic);
    let mut slots = [AesKey::ZERO; 4];
    if raw.slots[..count].iter().any(|slot| !slot.is_zero()) {
        let kaek = keys
            .key_area_key(header.kaek_index, key_generation)
            .context(MissingKeySnafu)?;
        for (slot, stored) in slots.iter_mut().zip(&raw.slots[..count]) {
            if stored.is_zero() {
                continue;
            }
            let mut block = stored.0;
            kaek.decrypt_block(&mut block);
            *slot = AesKey::from(block);
        }
    }

    Ok(KeyArea {
        slots,
        plaintext: false,
    })
}

pub(crate) fn encrypt_key_area(
    keys: &dyn KeyProvider,
    header: &NcaHeader,
    key_generation: u8,
    area: &KeyArea,
) -> Result<NcaKeyArea, NcaError> {
    let mut out = NcaKeyArea {
        slots: [HexData::ZERO; 4],
    };

    if area.plaintext {
        for (stored, slot) in out.slots.iter_mut().zip(area.slots.iter()) {
            *stored = HexData(*slot.as_bytes());
        }
        return Ok(out);
    }

    let count = key_slot_count(header.magic);
    if area.slots[..count].iter().any(|slot| !slot.is_zero()) {
        let kaek = keys
            .key_area_key(header.kaek_index, key_generation)
            .context(MissingKeySnafu)?;
        for (stored, slot) in out.slots.iter_mut().zip(&area.slots[..count]) {
            if slot.is_zero() {
                continue;
            }
            let mut block = *slot.as_bytes();
            kaek.encrypt_block(&mut block);
            *stored = HexData(block);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keyset::{KeyAreaKeyIndex, KeyProvider, MissingKeyError};
    use crate::ids::RightsId;

    struct Kaek(AesKey);

    impl KeyProvider for Kaek {
        fn header_key(&self) -> Result<AesXtsKey, MissingKeyError> {
            unimplemented!("not used by the key-area codec")
        }

        fn key_area_key(
            &self,
            _index: KeyAreaKeyIndex,
            _key_generation: u8,
        ) -> Result<AesKey, MissingKeyError> {
            Ok(self.0)
        }

        fn main_signature_modulus(&self, _key_generation: u8) -> Option<[u8; 0x100]> {
            None
        }
    }

    fn header_with_key_area(magic: NcaMagic, slots: [[u8; 0x10]; 4]) -> NcaHeader {
        let mut header = NcaHeader::test_blank(magic);
        header.encrypted_key_area = NcaKeyArea {
            slots: slots.map(HexData),
        };
        header
    }

    #[test]
    fn round_trips_through_the_kaek() {
        let keys = Kaek(AesKey::from([0x77; 0x10]));
        let header = header_with_key_area(
            NcaMagic::Nca3,
            [[0x10; 0x10], [0x21; 0x10], [0x32; 0x10], [0x43; 0x10]],
        );

        let area = decrypt_key_area(&keys, &header, 4).unwrap();
        let reencrypted = encrypt_key_area(&keys, &header, 4, &area).unwrap();
        assert_eq!(reencrypted, header.encrypted_key_area);

        // a decrypted slot actually differs from its stored form
        assert_ne!(area.slot(0).as_bytes(), &[0x10; 0x10]);
    }

    #[test]
    fn zero_slots_stay_zero() {
        let keys = Kaek(AesKey::from([0x77; 0x10]));
        let header = header_with_key_area(
            NcaMagic::Nca3,
            [[0x10; 0x10], [0; 0x10], [0x32; 0x10], [0; 0x10]],
        );

        let area = decrypt_key_area(&keys, &header, 4).unwrap();
        assert!(area.slot(1).is_zero());
        assert!(area.slot(3).is_zero());

        let reencrypted = encrypt_key_area(&keys, &header, 4, &area).unwrap();
        assert_eq!(reencrypted, header.encrypted_key_area);
    }

    #[test]
    fn nca0_only_decrypts_the_xts_pair() {
        let keys = Kaek(AesKey::from([0x77; 0x10]));
        let header = header_with_key_area(
            NcaMagic::Nca0,
            [[0x10; 0x10], [0x21; 0x10], [0x32; 0x10], [0x43; 0x10]],
        );

        let area = decrypt_key_area(&keys, &header, 0).unwrap();
        // slots beyond the NCA0 pair are never touched
        assert!(area.slot(2).is_zero());
        assert!(area.slot(3).is_zero());

        let reencrypted = encrypt_key_area(&keys, &header, 0, &area).unwrap();
        assert_eq!(&reencrypted.slots[..2], &header.encrypted_key_area.slots[..2]);
        assert!(reencrypted.slots[2].is_zero());
        assert!(reencrypted.slots[3].is_zero());
    }

    #[test]
    fn plaintext_key_area_is_copied_verbatim() {
        let keys = Kaek(AesKey::from([0x77; 0x10]));
        let header = header_with_key_area(NcaMagic::Nca0, [[0xAA; 0x10]; 4]);

        let slots = [AesKey::from([0xAA; 0x10]); 4];
        let area = KeyArea::from_slots(slots, true);
        let reencrypted = encrypt_key_area(&keys, &header, 0, &area).unwrap();
        assert_eq!(reencrypted, header.encrypted_key_area);
    }

    #[test]
    fn rights_id_header_is_unrelated_to_key_area() {
        // the codec itself never looks at the rights id; this documents that
        // the decision to skip it happens a level up
        let keys = Kaek(AesKey::from([0x77; 0x10]));
        let mut header = header_with_key_area(NcaMagic::Nca3, [[0x10; 0x10]; 4]);
        header.rights_id = RightsId::from([1; 0x10]);
        decrypt_key_area(&keys, &header, 4).unwrap();
    }
}
