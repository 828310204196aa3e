#![allow(dead_code)]
#[macro_use]
extern crate bitflags;

pub mod dtype;
pub mod gpu;
pub mod isa;

pub use dtype::{
    DType,
    DtypeGroup,
};
