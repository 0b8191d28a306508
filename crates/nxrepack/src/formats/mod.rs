pub mod cnmt;
pub mod nacp;
pub mod nca;
pub mod npdm;
pub mod nso;
pub mod pfs;
pub mod romfs;
pub mod ticket;
