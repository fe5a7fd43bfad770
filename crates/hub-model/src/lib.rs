// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod codec;
pub mod retry;
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use codec::CodecError;
pub use mock::{MockProvider, ScriptedProvider};
pub use openai_compat::ChatCompletionsProvider;
pub use provider::{DeltaFn, Provider, ProviderError};
pub use types::*;
