// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image inspection and the external vision services
//!
//! - byte-level format and dimension checks
//! - multimodal description (image in, description + relevance out)
//! - CDN rehosting of hotlink-protected images

pub mod describer;
pub mod image_utils;
pub mod rehost;

pub use describer::{parse_description, DescribeError, ImageDescriber, ImageDescription, VlmConfig, VlmDescriber};
pub use image_utils::{detect_format, inspect_image, to_data_url, ImageError, ImageInfo};
pub use rehost::{HttpRehoster, ImageRehoster, PassthroughRehoster, RehostConfig};
