// Cryptography module: payload encryption and signatures

pub mod encrypt;

pub use encrypt::{open, seal, seal_and_sign, verify_and_open, SEALED_OVERHEAD};
