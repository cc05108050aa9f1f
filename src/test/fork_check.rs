use super::{boot, kernel, kernel_with, switch_to, DATA, RO, RW, TEXT};
use crate::{env::{EnvID, EnvStatus}, err::Error, memory::mmu::{Perm, VirtAddr, PAGE_SIZE, USTACKTOP, UXSTACKTOP}};

const SHARED: VirtAddr = VirtAddr::new(0x0080_0000);

#[test]
fn fork_isolates_writable_pages() {
    let kernel = kernel();
    let mut parent = boot(&kernel);
    parent.write_word(DATA, 1).unwrap();
    let child = parent.fork().unwrap();
    let mut child_env = parent.fork_child(child).unwrap();
    assert_eq!(kernel.env_info(child).unwrap().env_status, EnvStatus::Runnable);

    // parent writes first: it takes the fault and gets its own copy
    parent.write_word(DATA, 2).unwrap();
    assert_eq!(parent.read_word(DATA).unwrap(), 2);

    switch_to(&parent, child);
    assert_eq!(child_env.read_word(DATA).unwrap(), 1);
    child_env.write_word(DATA, 3).unwrap();
    assert_eq!(child_env.read_word(DATA).unwrap(), 3);

    switch_to(&child_env, parent.thisenv());
    assert_eq!(parent.read_word(DATA).unwrap(), 2);

    let (p, p_perm) = kernel.lookup(parent.thisenv(), DATA).unwrap();
    let (c, c_perm) = kernel.lookup(child, DATA).unwrap();
    assert_ne!(p, c);
    assert_eq!(p_perm, RW);
    assert_eq!(c_perm, RW);
}

#[test]
fn fork_marks_both_sides_copy_on_write() {
    let kernel = kernel();
    let mut parent = boot(&kernel);
    let child = parent.fork().unwrap();
    let me = parent.thisenv();
    let cow = RO | Perm::COW;

    for va in [DATA, USTACKTOP - PAGE_SIZE] {
        let (p, p_perm) = kernel.lookup(me, va).unwrap();
        let (c, c_perm) = kernel.lookup(child, va).unwrap();
        assert_eq!(p, c);
        assert_eq!((p_perm, c_perm), (cow, cow));
        assert_eq!(kernel.page_ref(p), 2);
    }

    // read-only text stays plainly shared
    let (p, p_perm) = kernel.lookup(me, TEXT).unwrap();
    assert_eq!(kernel.lookup(child, TEXT), Some((p, p_perm)));
    assert_eq!(p_perm, RO);

    // exception stacks are private and writable
    let exstack = UXSTACKTOP - PAGE_SIZE;
    let (p, p_perm) = kernel.lookup(me, exstack).unwrap();
    let (c, c_perm) = kernel.lookup(child, exstack).unwrap();
    assert_ne!(p, c);
    assert_eq!((p_perm, c_perm), (RW, RW));
    assert_eq!(kernel.env_info(child).unwrap().env_pgfault_upcall, kernel.env_info(me).unwrap().env_pgfault_upcall);
}

#[test]
fn shared_read_only_page_never_faults() {
    let kernel = kernel();
    let mut parent = boot(&kernel);
    let child = parent.fork().unwrap();
    let mut child_env = parent.fork_child(child).unwrap();
    let (text, _) = kernel.lookup(parent.thisenv(), TEXT).unwrap();
    switch_to(&parent, child);
    let mut word = [0u8; 4];
    child_env.read(TEXT, &mut word).unwrap();
    assert_eq!(word, [0x0c, 0, 0, 0]);
    // still the parent's frame
    assert_eq!(kernel.lookup(child, TEXT).map(|(ppn, _)| ppn), Some(text));
}

#[test]
fn library_pages_stay_shared_and_writable() {
    let kernel = kernel();
    let mut parent = boot(&kernel);
    parent.syscall_mem_alloc(EnvID::zero(), SHARED, RW | Perm::LIBRARY).unwrap();
    let child = parent.fork().unwrap();
    let mut child_env = parent.fork_child(child).unwrap();
    assert_eq!(kernel.lookup(child, SHARED).map(|(_, perm)| perm), Some(RW | Perm::LIBRARY));

    switch_to(&parent, child);
    child_env.write_word(SHARED, 77).unwrap();
    switch_to(&child_env, parent.thisenv());
    assert_eq!(parent.read_word(SHARED).unwrap(), 77);
}

#[test]
fn chained_forks_are_isolated_from_later_writes() {
    let kernel = kernel();
    let mut grandparent = boot(&kernel);
    grandparent.write_word(DATA, 5).unwrap();
    let parent = grandparent.fork().unwrap();
    let mut parent_env = grandparent.fork_child(parent).unwrap();

    switch_to(&grandparent, parent);
    let child = parent_env.fork().unwrap();
    let mut child_env = parent_env.fork_child(child).unwrap();
    // the handler came along with the address space: no second exception stack
    assert!(parent_env.pgfault_handler().is_some());

    switch_to(&parent_env, grandparent.thisenv());
    grandparent.write_word(DATA, 9).unwrap();
    assert_eq!(grandparent.read_word(DATA).unwrap(), 9);

    switch_to(&grandparent, parent);
    assert_eq!(parent_env.read_word(DATA).unwrap(), 5);
    switch_to(&parent_env, child);
    assert_eq!(child_env.read_word(DATA).unwrap(), 5);
    child_env.write_word(DATA, 11).unwrap();
    switch_to(&child_env, parent);
    assert_eq!(parent_env.read_word(DATA).unwrap(), 5);
}

#[test]
fn failed_setup_destroys_the_child() {
    // the program takes 7 frames with its exception stack; a child needs 4
    // more, the last for the table covering the text
    let kernel = kernel_with(10);
    let mut parent = boot(&kernel);
    parent.set_pgfault_handler(|_, _| Ok(())).unwrap();
    let free = kernel.num_free_frames();
    assert_eq!(free, 3);
    assert_eq!(parent.fork(), Err(Error::NoMem));
    assert_eq!(kernel.num_free_frames(), free);
    // nothing was downgraded before the failure
    assert_eq!(kernel.lookup(parent.thisenv(), DATA).map(|(_, perm)| perm), Some(RW));

    let kernel = kernel_with(11);
    let mut parent = boot(&kernel);
    parent.fork().unwrap();
    assert_eq!(kernel.num_free_frames(), 0);
}

#[test]
fn abandoned_child_keeps_setup_error() {
    let kernel = kernel();
    let parent = boot(&kernel);
    let free = kernel.num_free_frames();
    let child = parent.syscall_exofork().unwrap();
    assert_eq!(parent.abandon(child, Error::NoMem), Error::NoMem);
    assert_eq!(kernel.env_info(child), Err(Error::BadEnv));
    assert_eq!(kernel.num_free_frames(), free);
    // the child is already gone: teardown fails, the setup error survives
    assert_eq!(parent.abandon(child, Error::NoMem), Error::NoMem);
}

#[test]
fn fork_child_checks_parentage() {
    let kernel = kernel();
    let mut parent = boot(&kernel);
    let child = parent.fork().unwrap();
    let child_env = parent.fork_child(child).unwrap();
    assert_eq!(child_env.fork_child(parent.thisenv()).err(), Some(Error::BadEnv));
    assert_eq!(parent.fork_child(EnvID::new(0x7ff)).err(), Some(Error::BadEnv));
}
