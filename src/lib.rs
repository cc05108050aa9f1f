#![cfg_attr(not(test), no_std)]

extern crate alloc;

/// error codes
pub mod err;
/// util
pub mod util;
/// memory management.
pub mod memory;
/// handle exception
pub mod exception;
/// environments, scheduling and system calls
pub mod env;
/// user library
pub mod ulib;
/// kernel init.
pub mod init;

pub use env::{schedule::{Dispatch, Machine}, syscall::{Completion, Syscall}, EnvID, EnvStatus, Image, Kernel, Segment};
pub use err::Error;
pub use init::KernelConfig;
pub use ulib::UserEnv;
