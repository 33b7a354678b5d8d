pub mod htlc;
pub mod wallet;
