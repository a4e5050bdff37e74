/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod bounce;
pub mod config;
pub mod core;
pub mod dkim;
pub mod fetch;
pub mod message;
pub mod outbound;
pub mod queue;
pub mod srs;
pub mod timers;
