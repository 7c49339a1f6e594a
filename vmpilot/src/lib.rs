#![doc = include_str!("../../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[cfg(doctest)]
mod doctests {
    doc_comment::doctest!("../../README.md");
}

pub mod api;
pub mod builder;
pub mod command;
pub mod config;
pub mod console;
pub mod descriptor;
pub mod hypervisor;
pub mod image;
pub mod mac;
pub mod provision;
pub mod seed;
pub mod vm;
