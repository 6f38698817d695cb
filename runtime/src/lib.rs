pub mod bitmap;
pub mod context;
pub mod coverage;
pub mod ffi;
pub mod setup;
pub mod shim;
