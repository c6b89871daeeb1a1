// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod decoder;
mod key;
mod reader;

pub use decoder::{KeypressDecoder, BACKSLASH_ENTER_WINDOW, MAX_SEQUENCE_BYTES};
pub use key::Key;
pub use reader::key_stream;
