/// trap frames and user fault delivery
pub mod traps;
