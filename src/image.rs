// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Layout of a loaded accelerator image: its UUID and compute units.
// Extracting this from an image file happens outside the shim.

use uuid::Uuid;

use crate::error::{ShimError, ShimResult};
use crate::proto::message::CuDescriptor;

/// One compute unit as described by the image's IP layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUnit {
    /// Full instance name, e.g. `"vadd:vadd_1"`.
    pub name: String,
    pub base_address: u64,
    /// Size of the CU register window; bounds register offsets.
    pub address_range: u64,
}

impl ComputeUnit {
    pub fn new(name: &str, base_address: u64, address_range: u64) -> Self {
        Self {
            name: name.to_owned(),
            base_address,
            address_range,
        }
    }
}

/// Compute-unit layout of an image. CU indices follow ascending base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    uuid: Uuid,
    compute_units: Vec<ComputeUnit>,
}

impl ImageLayout {
    pub fn new(uuid: Uuid, mut compute_units: Vec<ComputeUnit>) -> ShimResult<Self> {
        compute_units.sort_by_key(|cu| cu.base_address);
        let mut names: Vec<&str> = compute_units.iter().map(|cu| cu.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ShimError::Config(format!("duplicate compute unit {}", dup[0])));
        }
        Ok(Self {
            uuid,
            compute_units,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn compute_units(&self) -> &[ComputeUnit] {
        &self.compute_units
    }

    pub fn cu(&self, index: u32) -> ShimResult<&ComputeUnit> {
        self.compute_units
            .get(index as usize)
            .ok_or(ShimError::InvalidCu(index))
    }

    pub fn index_of(&self, name: &str) -> ShimResult<u32> {
        self.compute_units
            .iter()
            .position(|cu| cu.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| ShimError::NotFound(format!("compute unit {name}")))
    }

    /// Descriptors in CU index order, for the `LoadImage` exchange.
    pub fn descriptors(&self) -> Vec<CuDescriptor> {
        self.compute_units
            .iter()
            .map(|cu| CuDescriptor {
                name: cu.name.clone(),
                base_address: cu.base_address,
                address_range: cu.address_range,
            })
            .collect()
    }
}
