pub use binrw;
pub use snafu;

mod brw_utils;
pub mod cancel;
pub mod crypto;
pub mod filesystem;
pub mod formats;
pub mod hexstring;
pub mod ids;
pub mod repack;
pub mod storage;
