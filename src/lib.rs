// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod config;
pub mod coordination;
pub mod exporters;
pub mod tail;
