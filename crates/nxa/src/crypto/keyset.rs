use crate::crypto::{AesKey, AesXtsKey, KeyParseError, TitleKey};
use crate::ids::{IdParseError, RightsId};
use binrw::{BinRead, BinWrite};
use ini::Properties;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Resolves the keys the archive engine consumes.
///
/// `key_generation` is the archive's *effective* key generation,
/// `max(key_generation, key_generation_old)`; implementations are responsible
/// for mapping it onto whatever storage scheme they use.
pub trait KeyProvider: Send + Sync {
    /// The 32-byte XTS key pair the archive header is encrypted with.
    fn header_key(&self) -> Result<AesXtsKey, MissingKeyError>;

    /// Key-area encryption key for the given index class and key generation.
    fn key_area_key(
        &self,
        index: KeyAreaKeyIndex,
        key_generation: u8,
    ) -> Result<AesKey, MissingKeyError>;

    /// RSA-2048 modulus for the main header signature, selected by the
    /// header's signature key generation.
    fn main_signature_modulus(&self, key_generation: u8) -> Option<[u8; 0x100]>;

    /// Decrypts a single 16-byte key-area slot with the matching KAEK.
    fn decrypt_key_area_entry(
        &self,
        index: KeyAreaKeyIndex,
        key_generation: u8,
        entry: &[u8; 0x10],
    ) -> Result<[u8; 0x10], MissingKeyError> {
        let kaek = self.key_area_key(index, key_generation)?;
        let mut out = *entry;
        kaek.decrypt_block(&mut out);
        Ok(out)
    }
}

/// Resolves title keys for rights-id archives. The returned key is the final
/// working key (already decrypted with the title kek).
pub trait TicketProvider: Send + Sync {
    fn title_key(&self, rights_id: &RightsId, from_removable_storage: bool) -> Option<TitleKey>;
}

pub struct KeyName {
    pub key_name: &'static str,
    pub index: Option<u8>,
}

impl Debug for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(index) = self.index {
            write!(f, "{}_{:02x}", self.key_name, index)
        } else {
            write!(f, "{}", self.key_name)
        }
    }
}

impl Display for KeyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Snafu, Debug)]
pub struct MissingKeyError {
    pub key_name: KeyName,
}

#[derive(Snafu, Debug)]
pub enum KeySetParseError {
    #[snafu(display("Could not parse keyset file at line {} column {}: {}", line, col, msg))]
    CommonKeysFileParse {
        line: usize,
        col: usize,
        msg: String,
    },
    #[snafu(display(
        "Could not parse title keys file at line {} column {}: {}",
        line,
        col,
        msg
    ))]
    TitleKeysFileParse {
        line: usize,
        col: usize,
        msg: String,
    },

    #[snafu(display("Could not parse key {}: {}", key_name, source))]
    KeyParse {
        key_name: KeyName,
        source: KeyParseError,
    },
    #[snafu(display("Could not parse rightsid {}: {}", rights_id, source))]
    RightsIdParse {
        rights_id: String,
        source: IdParseError,
    },
    #[snafu(display("Could not parse title key for rightsid {:?}: {}", rights_id, source))]
    TitleKeyParse {
        rights_id: RightsId,
        source: KeyParseError,
    },
}

#[derive(Snafu, Debug)]
pub enum SystemKeysetError {
    Parse { source: KeySetParseError },
    NotFound { tried: Vec<PathBuf> },
    Io { source: std::io::Error },
}

/// Which class of key-area encryption keys an archive selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum KeyAreaKeyIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

/// A keyset in the format used by Hactool's `prod.keys` / `title.keys` files,
/// implementing both provider traits.
#[derive(Clone)]
pub struct KeySet {
    header_key: Option<AesXtsKey>,
    title_kek: [Option<AesKey>; 0x20],
    key_area_key_application: [Option<AesKey>; 0x20],
    key_area_key_ocean: [Option<AesKey>; 0x20],
    key_area_key_system: [Option<AesKey>; 0x20],
    /// Encrypted title keys, as read from `title.keys`.
    title_keys: HashMap<RightsId, TitleKey>,
    /// Main-signature moduli are baked into the host software rather than any
    /// key file, so they are inserted programmatically.
    main_signature_moduli: HashMap<u8, [u8; 0x100]>,
}

impl Default for KeySet {
    fn default() -> Self {
        Self {
            header_key: None,
            title_kek: [None; 0x20],
            key_area_key_application: [None; 0x20],
            key_area_key_ocean: [None; 0x20],
            key_area_key_system: [None; 0x20],
            title_keys: HashMap::new(),
            main_signature_moduli: HashMap::new(),
        }
    }
}

/// Key generations 0 and 1 both select the first key revision; everything
/// after is shifted down by one.
fn key_revision(key_generation: u8) -> usize {
    key_generation.saturating_sub(1) as usize
}

impl KeySet {
    /// Loads a keyset from a file. The file format is the same as the one used by Hactool.
    /// By default the file is searched in the ".switch" dir in
    ///     the user's home directory and in "switch" in user's config directory (according to `dirs-next` crate).
    ///
    /// One can also provide a path to a custom keyset file, then the system directories are ignored.
    pub fn from_system(keys_dir: Option<&Path>) -> Result<Self, SystemKeysetError> {
        let paths = if let Some(key_path) = keys_dir {
            vec![Some(key_path.into())]
        } else {
            vec![
                dirs_next::config_dir().map(|v| v.join("switch")),
                dirs_next::home_dir().map(|v| v.join(".switch")),
            ]
        }
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        let find_file = |file_name: &str| -> Result<PathBuf, SystemKeysetError> {
            for path in &paths {
                let file_path = path.join(file_name);
                if file_path.exists() {
                    return Ok(file_path);
                }
            }

            Err(SystemKeysetError::NotFound {
                tried: paths
                    .clone()
                    .into_iter()
                    .map(|p| p.join(file_name))
                    .collect(),
            })
        };

        let prod_keys_path = find_file("prod.keys")?;
        let title_keys_path = find_file("title.keys").ok();

        let prod_keys = std::fs::read_to_string(&prod_keys_path).context(IoSnafu)?;
        let title_keys = title_keys_path
            .as_ref()
            .map(|p| std::fs::read_to_string(p).context(IoSnafu))
            .transpose()?;

        Self::from_file_contents(&prod_keys, title_keys.as_deref().unwrap_or(""))
            .context(ParseSnafu {})
    }

    pub fn from_file_contents(
        common_keys: &str,
        title_keys: &str,
    ) -> Result<Self, KeySetParseError> {
        let common_keys = ini::Ini::load_from_str_noescape(common_keys).map_err(|e| {
            KeySetParseError::CommonKeysFileParse {
                line: e.line,
                col: e.col,
                msg: e.msg,
            }
        })?;
        let common_keys = common_keys.general_section();

        fn parse_key<K: FromStr<Err = KeyParseError>>(
            props: &Properties,
            name: &'static str,
        ) -> Result<Option<K>, KeySetParseError> {
            props
                .get(name)
                .map(|s| s.parse())
                .transpose()
                .map_err(|source| KeySetParseError::KeyParse {
                    key_name: KeyName {
                        key_name: name,
                        index: None,
                    },
                    source,
                })
        }

        fn parse_keys<K: FromStr<Err = KeyParseError> + Copy, const N: usize>(
            props: &Properties,
            name: &'static str,
        ) -> Result<[Option<K>; N], KeySetParseError> {
            let mut result = [None; N];
            for (i, result) in result.iter_mut().enumerate() {
                let key_name = KeyName {
                    key_name: name,
                    index: Some(i as u8),
                };
                let key = props
                    .get(&key_name.to_string())
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(|source| KeySetParseError::KeyParse { key_name, source })?;
                *result = key;
            }
            Ok(result)
        }

        let title_keys_ini = ini::Ini::load_from_str_noescape(title_keys).map_err(|e| {
            KeySetParseError::TitleKeysFileParse {
                line: e.line,
                col: e.col,
                msg: e.msg,
            }
        })?;

        let mut title_keys = HashMap::new();
        for (rights_id, title_key) in title_keys_ini.general_section().iter() {
            let rights_id = rights_id.parse().context(RightsIdParseSnafu {
                rights_id: rights_id.to_string(),
            })?;
            let title_key = title_key
                .parse()
                .context(TitleKeyParseSnafu { rights_id })?;
            title_keys.insert(rights_id, title_key);
        }

        Ok(Self {
            header_key: parse_key(common_keys, "header_key")?,
            title_kek: parse_keys(common_keys, "titlekek")?,
            key_area_key_application: parse_keys(common_keys, "key_area_key_application")?,
            key_area_key_ocean: parse_keys(common_keys, "key_area_key_ocean")?,
            key_area_key_system: parse_keys(common_keys, "key_area_key_system")?,
            title_keys,
            main_signature_moduli: HashMap::new(),
        })
    }

    /// Registers an encrypted title key, as carried by a ticket.
    pub fn import_title_key(&mut self, rights_id: RightsId, encrypted_title_key: TitleKey) {
        self.title_keys.insert(rights_id, encrypted_title_key);
    }

    pub fn set_main_signature_modulus(&mut self, key_generation: u8, modulus: [u8; 0x100]) {
        self.main_signature_moduli.insert(key_generation, modulus);
    }

    pub fn title_kek(&self, key_generation: u8) -> Result<AesKey, MissingKeyError> {
        self.title_kek[key_revision(key_generation)].ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: "titlekek",
                index: Some(key_generation),
            },
        })
    }
}

impl KeyProvider for KeySet {
    fn header_key(&self) -> Result<AesXtsKey, MissingKeyError> {
        self.header_key.ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: "header_key",
                index: None,
            },
        })
    }

    fn key_area_key(
        &self,
        index: KeyAreaKeyIndex,
        key_generation: u8,
    ) -> Result<AesKey, MissingKeyError> {
        let (kek_array, name) = match index {
            KeyAreaKeyIndex::Application => {
                (&self.key_area_key_application, "key_area_key_application")
            }
            KeyAreaKeyIndex::Ocean => (&self.key_area_key_ocean, "key_area_key_ocean"),
            KeyAreaKeyIndex::System => (&self.key_area_key_system, "key_area_key_system"),
        };
        kek_array[key_revision(key_generation)].ok_or(MissingKeyError {
            key_name: KeyName {
                key_name: name,
                index: Some(key_generation),
            },
        })
    }

    fn main_signature_modulus(&self, key_generation: u8) -> Option<[u8; 0x100]> {
        self.main_signature_moduli.get(&key_generation).copied()
    }
}

impl TicketProvider for KeySet {
    fn title_key(&self, rights_id: &RightsId, _from_removable_storage: bool) -> Option<TitleKey> {
        let encrypted = self.title_keys.get(rights_id)?;
        let title_kek = self.title_kek(rights_id.key_generation()).ok()?;
        Some(encrypted.decrypt(title_kek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON_KEYS: &str = "\
header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
titlekek_00 = 202122232425262728292a2b2c2d2e2f
key_area_key_application_00 = 303132333435363738393a3b3c3d3e3f
key_area_key_application_01 = 404142434445464748494a4b4c4d4e4f
";

    const TITLE_KEYS: &str = "\
01002b30028f60000000000000000001 = 505152535455565758595a5b5c5d5e5f
";

    #[test]
    fn parses_hactool_format() {
        let keys = KeySet::from_file_contents(COMMON_KEYS, TITLE_KEYS).unwrap();

        keys.header_key().unwrap();
        // generations 0 and 1 both resolve the first revision
        let gen0 = keys
            .key_area_key(KeyAreaKeyIndex::Application, 0)
            .unwrap();
        let gen1 = keys
            .key_area_key(KeyAreaKeyIndex::Application, 1)
            .unwrap();
        assert_eq!(gen0, gen1);
        let gen2 = keys
            .key_area_key(KeyAreaKeyIndex::Application, 2)
            .unwrap();
        assert_ne!(gen0, gen2);

        assert!(keys.key_area_key(KeyAreaKeyIndex::Ocean, 0).is_err());
        assert!(keys.key_area_key(KeyAreaKeyIndex::Application, 3).is_err());

        // the provided entry helper inverts an ECB-encrypted slot
        let mut slot = [0x5Au8; 0x10];
        gen0.encrypt_block(&mut slot);
        let decrypted = keys
            .decrypt_key_area_entry(KeyAreaKeyIndex::Application, 0, &slot)
            .unwrap();
        assert_eq!(decrypted, [0x5A; 0x10]);
    }

    #[test]
    fn title_keys_are_decrypted_on_lookup() {
        let keys = KeySet::from_file_contents(COMMON_KEYS, TITLE_KEYS).unwrap();
        let rights_id: RightsId = "01002b30028f60000000000000000001".parse().unwrap();

        let stored: TitleKey = "505152535455565758595a5b5c5d5e5f".parse().unwrap();
        let expected = stored.decrypt(keys.title_kek(1).unwrap());

        let resolved = TicketProvider::title_key(&keys, &rights_id, false).unwrap();
        assert_eq!(resolved, expected);

        let unknown: RightsId = "ffffffffffffffffffffffffffffff01".parse().unwrap();
        assert!(TicketProvider::title_key(&keys, &unknown, false).is_none());
    }

    #[test]
    fn missing_keys_are_reported_by_name() {
        let keys = KeySet::default();
        let err = keys.header_key().unwrap_err();
        assert_eq!(err.key_name.to_string(), "header_key");
    }
}
