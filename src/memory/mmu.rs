use core::{fmt, ops::{Add, AddAssign, Sub}};

use bitflags::bitflags;

/// page size
pub const PAGE_SIZE: usize = 4096;
pub const PTMAP: usize = PAGE_SIZE;
pub const PDMAP: usize = 4 * 1024 * 1024;
/// page shift
pub const PGSHIFT: usize = 12;
/// page diretory shift
pub const PDSHIFT: usize = 22;
/// page table entry hard flag shift
pub const PTE_HARDFLAG_SHIFT: usize = 6;

/*
 o     ULIM     -----> +----------------------------+------------0x8000 0000-------
 o                     |         User VPT           |     PDMAP
 o      UVPT    -----> +----------------------------+------------0x7fc0 0000
 o                     |           pages            |     PDMAP
 o      UPAGES  -----> +----------------------------+------------0x7f80 0000
 o                     |           envs             |     PDMAP
 o  UTOP,UENVS  -----> +----------------------------+------------0x7f40 0000
 o  UXSTACKTOP -/      |     user exception stack   |     PTMAP
 o                     +----------------------------+------------0x7f3f f000
 o                     |        invalid memory      |     PTMAP
 o      USTACKTOP ---> +----------------------------+------------0x7f3f e000
 o                     |     normal user stack      |
 o                     ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 o      UTEXT   -----> +----------------------------+------------0x0040 0000
 o                     |      reserved for COW      |     PTMAP
 o       UCOW   -----> +----------------------------+------------0x003f f000
*/
pub const ULIM: usize = 0x80000000;
pub const UVPT: VirtAddr = VirtAddr::new(ULIM - PDMAP);
pub const UPAGES: VirtAddr = VirtAddr::new(UVPT.0 - PDMAP);
pub const UENVS: VirtAddr = VirtAddr::new(UPAGES.0 - PDMAP);
pub const UTOP: VirtAddr = UENVS;
pub const UXSTACKTOP: VirtAddr = UTOP;
pub const USTACKTOP: VirtAddr = VirtAddr::new(UTOP.0 - 2 * PTMAP);
pub const UTEXT: VirtAddr = VirtAddr::new(PDMAP);
pub const UCOW: VirtAddr = VirtAddr::new(UTEXT.0 - PTMAP);

bitflags! {
    /// Permission bits of a page table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: usize {
        /// copy-on-write, software bit
        const COW = 0x0001;
        /// shared across fork, software bit
        const LIBRARY = 0x0002;
        /// user accessible
        const USER = 0x0004;
        /// global, kernel only
        const G = 0x0001 << PTE_HARDFLAG_SHIFT;
        /// valid (present)
        const V = 0x0002 << PTE_HARDFLAG_SHIFT;
        /// dirty, i.e. writable
        const D = 0x0004 << PTE_HARDFLAG_SHIFT;
    }
}

impl Perm {
    /// bits a user environment may pass to the memory system calls.
    pub const SYSCALL: Perm = Perm::V.union(Perm::USER).union(Perm::D).union(Perm::COW).union(Perm::LIBRARY);
    /// bits every user mapping must carry.
    pub const REQUIRED: Perm = Perm::V.union(Perm::USER);

    /// check a permission set handed in by user space.
    #[inline]
    pub fn is_valid_user(self) -> bool {
        self.contains(Perm::REQUIRED) && Perm::SYSCALL.contains(self)
    }

    #[inline]
    pub fn writable(self) -> bool {
        self.contains(Perm::D)
    }
}

/// Physical address, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct PhysAddr(usize);

/// Virtual address, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct VirtAddr(usize);

/// Physical page number, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct PhysPageNum(usize);

impl VirtAddr {
    /// create a new virtual address from numeric value.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
    /// the raw value of virtual address.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
    /// check if the address is null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    /// page directory index
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDSHIFT) & 0x3ff
    }
    /// page table index
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PGSHIFT) & 0x3ff
    }
    /// build an address from directory and table indices.
    #[inline]
    pub const fn from_indices(pdx: usize, ptx: usize) -> Self {
        Self((pdx << PDSHIFT) | (ptx << PGSHIFT))
    }
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self::new(self.0 & !(PAGE_SIZE - 1))
    }
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }
    /// page aligned and below `UTOP`.
    #[inline]
    pub const fn is_user_page(self) -> bool {
        self.is_aligned(PAGE_SIZE) && self.0 < UTOP.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "va:{:#010x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pa:{:#010x}", self.0)
    }
}

impl fmt::Debug for PhysPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ppn:{:#x}", self.0)
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: usize) -> Self::Output {
        Self::Output::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtAddr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, rhs: usize) -> Self::Output {
        Self::Output::new(self.0 - rhs)
    }
}

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    /// the raw value of this physical address.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl PhysPageNum {
    #[inline]
    pub const fn new(ppn: usize) -> Self {
        Self(ppn)
    }
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(value: PhysPageNum) -> Self {
        PhysAddr::new(value.0 << PGSHIFT)
    }
}

impl From<PhysAddr> for PhysPageNum {
    fn from(value: PhysAddr) -> Self {
        PhysPageNum::new(value.0 >> PGSHIFT)
    }
}
