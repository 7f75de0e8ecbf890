//! Default implementations of [crate::backend::Transport]

pub mod local;
pub mod tcp;
