pub mod bitset;
pub mod logging;
