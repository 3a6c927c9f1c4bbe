// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fail;
pub mod logging;
pub mod memory;
pub mod semaphore;
pub mod timer;

pub use fail::Fail;
pub use memory::{Packet, PacketId};
pub use semaphore::BinarySemaphore;
