pub mod p2p_demo;
pub mod rewrite;
