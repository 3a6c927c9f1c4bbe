// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod conn;
pub mod link;

pub use conn::{ConnHandle, ConnReceiver, ListenSocket};
pub use link::{BufferedLink, SendDirect};
