// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

// Not every integration test binary uses every helper
#![allow(dead_code)]

pub mod nodes;
