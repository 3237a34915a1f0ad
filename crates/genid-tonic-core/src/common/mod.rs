mod convert;
mod error;

pub use error::*;

/// Messages and service bindings generated from `proto/genid.proto`.
pub mod proto {
    tonic::include_proto!("genid");

    /// Encoded descriptor set for `tonic-reflection`.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("genid_descriptor");
}
