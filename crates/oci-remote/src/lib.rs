//! A client for pulling images from OCI and Docker V2 registries
//!
//! Opening an image pings its registry, negotiates authentication
//! (anonymous, Basic, or Bearer tokens) and returns a [`RemoteImage`] whose
//! accessors fetch manifests, configs and blobs by digest.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod digest;
pub mod errors;
pub mod image;
pub mod manifest;
mod reference;
pub mod remote;
pub mod secrets;
pub mod transport;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use client::{Client, ClientConfig, ClientProtocol};
#[doc(inline)]
pub use digest::Digest;
#[doc(inline)]
pub use image::Image;
#[doc(inline)]
pub use reference::{ParseError, Reference};
#[doc(inline)]
pub use remote::RemoteImage;
