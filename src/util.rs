/// index linked list
pub mod queue;
