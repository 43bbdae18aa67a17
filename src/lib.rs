// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Pieces of `camrigd` shared with the `camrigctl` control CLI: the hyper
//! JSON client both talk over.

pub mod http_client;
