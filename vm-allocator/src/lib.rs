// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// SPDX-License-Identifier: Apache-2.0 OR MIT
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Manages the physical memory handed to a domain while it is restored.

#[macro_use]
extern crate log;
extern crate vm_memory;

mod bitmap;
mod superpage;

pub use crate::bitmap::{Bitmap, BitmapError, SetBits};
pub use crate::superpage::{
    AllocatorError, SuperpageAllocator, SUPERPAGE_1GB_NR_PFNS, SUPERPAGE_1GB_SHIFT,
    SUPERPAGE_2MB_NR_PFNS, SUPERPAGE_2MB_SHIFT,
};
