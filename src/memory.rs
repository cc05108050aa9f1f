pub mod mmu;
pub mod frame;
pub mod page_table;

use crate::err::Error;
