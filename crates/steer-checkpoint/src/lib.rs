//! steer-checkpoint — prepare a container checkpoint for restore on
//! another host.
//!
//! A migrating backend is checkpointed with its listening sockets bound to
//! the old address. Before restore, [`CheckpointPatcher`] rewrites:
//!
//! - `checkpoint/files.img`: inet sockets bound to the old address or a
//!   wildcard now bind the new one (decoded through a [`SocketImageCodec`])
//! - `network.status` and `config.dump`: the container's own address
//! - optionally, image ids in container metadata, replaced by an image name
//!
//! Directories and `.tar` archives are both accepted. If no socket matches,
//! the patch aborts with every observed address and leaves the checkpoint
//! untouched.

pub mod codec;
pub mod error;
pub mod patcher;

mod image_ref;
mod records;
mod sockets;

pub use codec::{CritCodec, JsonCodec, SocketImageCodec};
pub use error::{PatchError, PatchResult};
pub use patcher::{CheckpointPatcher, PatchReport, PatchRequest, SOCKET_IMAGE};
