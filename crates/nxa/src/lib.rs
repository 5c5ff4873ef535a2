pub use binrw;

pub mod crypto;
pub mod formats;
mod hexstring;
pub mod ids;
pub mod storage;

pub use hexstring::HexData;
