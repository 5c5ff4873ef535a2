use crate::hexstring::HexData;
use aes::Aes128;
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;

pub const AES_BLOCK_SIZE: usize = 0x10;
pub const SHA256_HASH_SIZE: usize = 0x20;
pub const RSA2048_SIGNATURE_SIZE: usize = 0x100;
/// The fixed public exponent of every main-signature key: {0x01, 0x00, 0x01}.
pub const RSA_PUBLIC_EXPONENT: u32 = 0x10001;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// A title key as resolved by a ticket provider (already decrypted with the
/// title kek unless it is still inside a key file).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(HexData<0x10>);

/// A pair of AES-128 keys used for XTS (data key + tweak key).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl TitleKey {
    /// Decrypts an encrypted title key (as stored in tickets and title key
    /// files) with the title kek of its key generation.
    pub fn decrypt(&self, title_kek: AesKey) -> TitleKey {
        let mut key = self.0 .0;
        title_kek.decrypt_block(&mut key);
        TitleKey(HexData(key))
    }

    pub fn as_aes_key(&self) -> AesKey {
        AesKey(self.0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl AesKey {
    pub const ZERO: Self = AesKey(HexData::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8; 0x10] {
        &self.0 .0
    }

    #[inline]
    fn cipher(&self) -> Aes128 {
        use cipher::KeyInit;
        Aes128::new(GenericArray::from_slice(&self.0 .0))
    }

    /// AES-128-ECB over a single 16-byte block (key-area slots, title keys).
    pub fn decrypt_block(&self, block: &mut [u8; 0x10]) {
        use cipher::BlockDecrypt;
        self.cipher()
            .decrypt_block(GenericArray::from_mut_slice(block));
    }

    pub fn encrypt_block(&self, block: &mut [u8; 0x10]) {
        use cipher::BlockEncrypt;
        self.cipher()
            .encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn apply_ctr(&self, buf: &mut [u8], iv: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        if buf.len() % AES_BLOCK_SIZE != 0 {
            panic!("Length must be multiple of the AES block size!")
        }

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(iv);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }

    /// Decrypt blocks in CTR mode with a fully-built 16-byte counter.
    pub fn decrypt_ctr(&self, buf: &mut [u8], iv: &[u8; 0x10]) {
        self.apply_ctr(buf, iv)
    }

    pub fn encrypt_ctr(&self, buf: &mut [u8], iv: &[u8; 0x10]) {
        self.apply_ctr(buf, iv)
    }
}

/// Builds the CTR counter for a content offset: the section's upper IV in the
/// high half, `offset / 16` big-endian in the low half.
pub fn ctr_iv(upper_iv: u64, offset: u64) -> [u8; 0x10] {
    let mut iv = [0; 0x10];
    iv[..0x8].copy_from_slice(&upper_iv.to_be_bytes());
    iv[0x8..].copy_from_slice(&(offset / AES_BLOCK_SIZE as u64).to_be_bytes());
    iv
}

/// CTR-Ex counter: like [`ctr_iv`], but the 32-bit generation value replaces
/// the low word of the upper half (IV bytes 4..8).
pub fn ctr_ex_iv(upper_iv: u64, generation: u32, offset: u64) -> [u8; 0x10] {
    let mut iv = ctr_iv(upper_iv, offset);
    iv[0x4..0x8].copy_from_slice(&generation.to_be_bytes());
    iv
}

fn get_tweak(mut sector: usize) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        /* Nintendo LE custom tweak... */
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    /// Joins two key-area slots into an XTS key pair.
    pub fn from_slots(key1: [u8; 0x10], key2: [u8; 0x10]) -> Self {
        let mut data = [0; 0x20];
        data[..0x10].copy_from_slice(&key1);
        data[0x10..].copy_from_slice(&key2);
        AesXtsKey(HexData(data))
    }

    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; SHA256_HASH_SIZE] {
    use digest::Digest;
    let mut hasher = sha2::Sha256::default();
    hasher.update(data);
    hasher.finalize().into()
}

/// Verifies an RSA-2048-PSS-SHA-256 signature against the given modulus and
/// the fixed public exponent. Any malformed input verifies as `false`.
pub fn verify_rsa2048_pss_sha256(
    modulus: &[u8; RSA2048_SIGNATURE_SIZE],
    data: &[u8],
    signature: &[u8; RSA2048_SIGNATURE_SIZE],
) -> bool {
    use rsa::pss::Pss;
    use rsa::{BigUint, RsaPublicKey};

    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(RSA_PUBLIC_EXPONENT);
    let key = match RsaPublicKey::new(n, e) {
        Ok(key) => key,
        Err(_) => return false,
    };

    key.verify(Pss::new::<sha2::Sha256>(), &sha256(data), signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> AesKey {
        AesKey::from([byte; 0x10])
    }

    #[test]
    fn ecb_block_round_trip() {
        let key = key(0x42);
        let plain = *b"0123456789abcdef";
        let mut block = plain;
        key.encrypt_block(&mut block);
        assert_ne!(block, plain);
        key.decrypt_block(&mut block);
        assert_eq!(block, plain);
    }

    #[test]
    fn ctr_iv_layout() {
        let iv = ctr_iv(0xDEADBEEF00000000, 0x1230);
        assert_eq!(&iv[..0x8], &[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);
        assert_eq!(&iv[0x8..], &0x123u64.to_be_bytes());

        let iv = ctr_ex_iv(0xDEADBEEF00000000, 0x11223344, 0x1230);
        assert_eq!(&iv[..0x8], &[0xDE, 0xAD, 0xBE, 0xEF, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&iv[0x8..], &0x123u64.to_be_bytes());
    }

    /// The counter law: decrypting a sub-range with a counter seeded from its
    /// own offset must equal the same bytes of a whole-buffer decryption.
    #[test]
    fn ctr_keystream_continuity() {
        let key = key(0x17);
        let upper = 0x0011223344556677u64;

        let plain: Vec<u8> = (0..0x100u32).map(|i| (i * 7) as u8).collect();
        let mut cipher = plain.clone();
        key.encrypt_ctr(&mut cipher, &ctr_iv(upper, 0x4000));

        for &(offset, size) in &[(0x4000u64, 0x100usize), (0x4010, 0x20), (0x40f0, 0x10)] {
            let base = (offset - 0x4000) as usize;
            let mut part = cipher[base..base + size].to_vec();
            key.decrypt_ctr(&mut part, &ctr_iv(upper, offset));
            assert_eq!(part, &plain[base..base + size]);
        }
    }

    #[test]
    fn xts_sector_stepping() {
        let key: AesXtsKey = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            .parse()
            .unwrap();

        let plain = vec![0x5au8; 0x400];
        let mut cipher = plain.clone();
        key.encrypt(&mut cipher, 7, 0x200);
        assert_ne!(cipher, plain);

        // decrypting sector-by-sector with matching sector numbers inverts it
        let mut first = cipher[..0x200].to_vec();
        let mut second = cipher[0x200..].to_vec();
        key.decrypt(&mut first, 7, 0x200);
        key.decrypt(&mut second, 8, 0x200);
        assert_eq!(first, &plain[..0x200]);
        assert_eq!(second, &plain[0x200..]);

        // a wrong sector number does not
        let mut wrong = cipher[..0x200].to_vec();
        key.decrypt(&mut wrong, 8, 0x200);
        assert_ne!(wrong, &plain[..0x200]);
    }

    #[test]
    fn xts_key_halves_matter() {
        let joined = AesXtsKey::from_slots([1; 0x10], [2; 0x10]);
        let swapped = AesXtsKey::from_slots([2; 0x10], [1; 0x10]);

        let mut a = vec![0u8; 0x200];
        let mut b = vec![0u8; 0x200];
        joined.encrypt(&mut a, 0, 0x200);
        swapped.encrypt(&mut b, 0, 0x200);
        assert_ne!(a, b);
    }

    #[test]
    fn rsa_pss_verify() {
        use rsa::pss::Pss;
        use rsa::traits::PublicKeyParts;
        use rsa::RsaPrivateKey;

        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let data = b"signed header area";
        let raw_sig = private
            .sign_with_rng(&mut rng, Pss::new::<sha2::Sha256>(), &sha256(data))
            .unwrap();

        let mut signature = [0u8; RSA2048_SIGNATURE_SIZE];
        signature[RSA2048_SIGNATURE_SIZE - raw_sig.len()..].copy_from_slice(&raw_sig);

        let mut modulus = [0u8; RSA2048_SIGNATURE_SIZE];
        let n = private.n().to_bytes_be();
        modulus[RSA2048_SIGNATURE_SIZE - n.len()..].copy_from_slice(&n);

        assert!(verify_rsa2048_pss_sha256(&modulus, data, &signature));
        assert!(!verify_rsa2048_pss_sha256(
            &modulus,
            b"tampered header area",
            &signature
        ));
    }
}
