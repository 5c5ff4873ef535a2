use binrw::{BinRead, BinWrite};

/// A fixed-size byte array that formats and serializes as a hex string.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead, BinWrite)]
pub struct HexData<const N: usize>(pub [u8; N]);

impl<const N: usize> HexData<N> {
    pub const ZERO: Self = HexData([0; N]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl<const N: usize> core::fmt::Debug for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> core::fmt::Display for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl<const N: usize> serde::Serialize for HexData<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de, const N: usize> serde::Deserialize<'de> for HexData<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        let mut value = [0; N];
        hex::decode_to_slice(&s, &mut value)
            .map_err(|_| D::Error::invalid_value(serde::de::Unexpected::Str(&s), &"a hexstring"))?;
        Ok(HexData(value))
    }
}

impl<const N: usize> AsRef<[u8]> for HexData<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> AsMut<[u8]> for HexData<N> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> From<[u8; N]> for HexData<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<HexData<N>> for [u8; N] {
    fn from(value: HexData<N>) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::HexData;

    #[test]
    fn formats_as_hex() {
        let data = HexData([0x00, 0xab, 0x10, 0xff]);
        assert_eq!(format!("{}", data), "00AB10FF");
    }

    #[test]
    fn zero_detection() {
        assert!(HexData::<4>::ZERO.is_zero());
        assert!(!HexData([0, 0, 1, 0]).is_zero());
    }
}
