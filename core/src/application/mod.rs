// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod session_broker;
