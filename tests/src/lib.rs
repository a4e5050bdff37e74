/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod worker;
