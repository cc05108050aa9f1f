use alloc::{vec, vec::Vec};

use super::{mmu::{PhysAddr, PhysPageNum, PAGE_SIZE}, Error};

type PhysFrameLink = Option<PhysPageNum>;

pub struct PhysFrame {
    pf_link: PhysFrameLink,
    pf_ref: u16
}

pub struct PhysFrameList {
    head: PhysFrameLink
}

/// Physical memory: frame bookkeeping plus the backing RAM.
pub struct FrameAllocator {
    frames: Vec<PhysFrame>,
    ram: Vec<u8>,
    nfree: usize,
    frames_free_list: PhysFrameList
}

impl FrameAllocator {
    pub fn new(nframes: usize) -> Self {
        let mut fa = Self {
            frames: Vec::with_capacity(nframes),
            ram: vec![0; nframes * PAGE_SIZE],
            nfree: 0,
            frames_free_list: PhysFrameList {
                head: None
            }
        };
        fa.frames.resize_with(nframes, || PhysFrame { pf_link: None, pf_ref: 0 });
        // lowest frames end up at the head of the free list
        for ppn in (0..nframes).rev() {
            fa.push(PhysPageNum::new(ppn));
        }
        fa
    }

    #[inline]
    fn get_frame_mut_by_ppn(&mut self, ppn: PhysPageNum) -> &mut PhysFrame {
        &mut self.frames[ppn.as_usize()]
    }

    #[inline]
    fn get_frame_by_ppn(&self, ppn: PhysPageNum) -> &PhysFrame {
        &self.frames[ppn.as_usize()]
    }

    #[inline]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn num_free_frames(&self) -> usize {
        self.nfree
    }

    /// take a zeroed frame off the free list. Its reference count stays 0
    /// until somebody maps it.
    #[inline]
    pub fn alloc(&mut self) -> Result<PhysPageNum, Error> {
        match self.pop() {
            Some(ppn) => {
                self.page_mut(ppn).fill(0);
                Ok(ppn)
            },
            None => Err(Error::NoMem),
        }
    }

    #[inline]
    pub fn dealloc(&mut self, ppn: PhysPageNum) {
        assert!(self.get_frame_by_ppn(ppn).pf_ref == 0);
        self.push(ppn);
    }

    #[inline]
    pub fn incref(&mut self, ppn: PhysPageNum) {
        self.get_frame_mut_by_ppn(ppn).pf_ref += 1;
    }

    #[inline]
    pub fn decref(&mut self, ppn: PhysPageNum) {
        let frame = self.get_frame_mut_by_ppn(ppn);
        assert!(frame.pf_ref > 0);
        frame.pf_ref -= 1;
        if frame.pf_ref == 0 {
            self.dealloc(ppn);
        }
    }

    #[inline]
    pub fn refcount(&self, ppn: PhysPageNum) -> u16 {
        self.get_frame_by_ppn(ppn).pf_ref
    }

    #[inline]
    pub fn page(&self, ppn: PhysPageNum) -> &[u8] {
        let base = PhysAddr::from(ppn).as_usize();
        &self.ram[base..base + PAGE_SIZE]
    }

    #[inline]
    pub fn page_mut(&mut self, ppn: PhysPageNum) -> &mut [u8] {
        let base = PhysAddr::from(ppn).as_usize();
        &mut self.ram[base..base + PAGE_SIZE]
    }

    #[inline]
    fn push(&mut self, ppn: PhysPageNum) {
        let head = self.frames_free_list.head;
        self.get_frame_mut_by_ppn(ppn).pf_link = head;
        self.frames_free_list.head = Some(ppn);
        self.nfree += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<PhysPageNum> {
        let head = self.frames_free_list.head?;
        self.frames_free_list.head = self.get_frame_by_ppn(head).pf_link;
        self.get_frame_mut_by_ppn(head).pf_link = None;
        self.nfree -= 1;
        Some(head)
    }
}
