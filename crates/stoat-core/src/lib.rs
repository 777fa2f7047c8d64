//! # stoat-core
//!
//! Core types shared by every Stoat crate.
//!
//! This crate provides:
//! - [`Device`] — compute device identity, plus the thread-local current
//!   device and the RAII [`DeviceGuard`] used when touching foreign tensors
//! - [`Tensor`] — the narrow, object-safe contract the autograd engine
//!   requires from a tensor library
//! - [`Error`] / [`Result`] — the single error type used across the library

pub mod device;
pub mod error;
pub mod tensor;

pub use device::{Device, DeviceGuard};
pub use error::{Error, Result};
pub use tensor::Tensor;
