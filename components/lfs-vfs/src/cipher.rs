//! AES-128-CBC applied independently to every I/O unit of the image.
//!
//! The IV of a unit is its absolute flash offset (filesystem region plus the
//! reserved area in front of it) stored little-endian in the first eight IV
//! bytes. The same offset therefore always gets the same IV, which keeps
//! images compatible with the device but means rewriting an offset reuses
//! its IV.

use std::{fs, path::Path};

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use vfs::{Error, Result};

pub const KEY_SIZE: usize = 16;
/// Size of the key table files written by the provisioning tools; only the
/// leading key is used.
pub const KEY_TABLE_SIZE: usize = 128;
pub const BLOCK_LEN: usize = 16;
pub const IV_SIZE: usize = 16;

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

#[derive(Clone)]
pub struct BlockCipher {
    key: [u8; KEY_SIZE],
}

impl core::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

impl BlockCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key = key.try_into().map_err(|_| {
            Error::Crypto(format!("invalid key length: {} bits", key.len() * 8))
        })?;
        Ok(Self { key })
    }

    /// Loads a raw 16-byte key or a 128-byte key table.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        match data.len() {
            KEY_SIZE | KEY_TABLE_SIZE => Self::new(&data[..KEY_SIZE]),
            len => Err(Error::Crypto(format!(
                "{}: expected {KEY_SIZE} or {KEY_TABLE_SIZE} bytes, found {len}",
                path.display()
            ))),
        }
    }

    pub fn iv(offset: u64) -> [u8; IV_SIZE] {
        let mut iv = [0; IV_SIZE];
        iv[..8].copy_from_slice(&offset.to_le_bytes());
        iv
    }

    /// Encrypts one I/O unit in place.
    pub fn encrypt(&self, offset: u64, unit: &mut [u8]) -> Result<()> {
        let len = check_len(unit.len())?;
        Encryptor::new_from_slices(&self.key, &Self::iv(offset))
            .map_err(|_| Error::Crypto("key schedule rejected".into()))?
            .encrypt_padded_mut::<NoPadding>(unit, len)
            .map_err(|_| Error::Crypto(format!("block length mismatch: {len}")))?;
        Ok(())
    }

    /// Decrypts one I/O unit in place.
    pub fn decrypt(&self, offset: u64, unit: &mut [u8]) -> Result<()> {
        let len = check_len(unit.len())?;
        Decryptor::new_from_slices(&self.key, &Self::iv(offset))
            .map_err(|_| Error::Crypto("key schedule rejected".into()))?
            .decrypt_padded_mut::<NoPadding>(unit)
            .map_err(|_| Error::Crypto(format!("block length mismatch: {len}")))?;
        Ok(())
    }
}

fn check_len(len: usize) -> Result<usize> {
    if len == 0 || len % BLOCK_LEN != 0 {
        return Err(Error::Crypto(format!("block length mismatch: {len}")));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};

    use super::*;

    const KEY: [u8; KEY_SIZE] = *b"0123456789abcdef";

    #[test]
    fn iv_is_little_endian_offset() {
        let iv = BlockCipher::iv(0x0102_0304_0506_0708);
        assert_eq!(iv[..8], [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(iv[8..], [0; 8]);
    }

    #[test]
    fn first_block_is_chained_with_offset_iv() {
        let cipher = BlockCipher::new(&KEY).unwrap();
        let offset = 0x25_000 + 4096;
        let mut unit = [0x5au8; 32];
        cipher.encrypt(offset, &mut unit).unwrap();

        let mut expected = [0x5au8; 16];
        for (byte, iv) in expected.iter_mut().zip(BlockCipher::iv(offset)) {
            *byte ^= iv;
        }
        let mut block = GenericArray::clone_from_slice(&expected);
        Aes128::new(GenericArray::from_slice(&KEY)).encrypt_block(&mut block);
        assert_eq!(unit[..16], block[..]);
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let cipher = BlockCipher::new(&KEY).unwrap();
        let plain: Vec<u8> = (0..=255u8).collect();
        for offset in [0, 256, 0x25_000, u64::MAX - 255] {
            let mut unit = plain.clone();
            cipher.encrypt(offset, &mut unit).unwrap();
            assert_ne!(unit, plain);
            cipher.decrypt(offset, &mut unit).unwrap();
            assert_eq!(unit, plain);
        }
    }

    #[test]
    fn offset_changes_ciphertext() {
        let cipher = BlockCipher::new(&KEY).unwrap();
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        cipher.encrypt(0, &mut a).unwrap();
        cipher.encrypt(64, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_key_and_unit_lengths() {
        assert!(matches!(BlockCipher::new(&KEY[..15]), Err(Error::Crypto(_))));
        let cipher = BlockCipher::new(&KEY).unwrap();
        assert!(matches!(
            cipher.encrypt(0, &mut [0u8; 20]),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(cipher.decrypt(0, &mut []), Err(Error::Crypto(_))));
    }

    #[test]
    fn key_files() {
        let dir = tempfile::tempdir().unwrap();

        let raw = dir.path().join("raw.key");
        fs::write(&raw, KEY).unwrap();
        assert!(BlockCipher::from_key_file(&raw).is_ok());

        let mut table = [0xeeu8; KEY_TABLE_SIZE];
        table[..KEY_SIZE].copy_from_slice(&KEY);
        let table_path = dir.path().join("table.key");
        fs::write(&table_path, table).unwrap();
        let from_table = BlockCipher::from_key_file(&table_path).unwrap();
        assert_eq!(from_table.key, KEY);

        let short = dir.path().join("short.key");
        fs::write(&short, [0u8; 20]).unwrap();
        assert!(matches!(
            BlockCipher::from_key_file(&short),
            Err(Error::Crypto(_))
        ));
    }
}
