//! Native code addresses that survive image relocation.
//!
//! The loader registers every instrumented code region in a [`CodeSpace`].
//! A [`CodePointerCell`] only accepts addresses inside one of those regions and
//! remembers the region-relative offset, so a snapshot reload can recompute the
//! address against the image's new base.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{CodeError, RelocationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    pub image: Arc<str>,
    pub base: usize,
    pub len: usize,
}

impl CodeRegion {
    pub fn new(image: &str, base: usize, len: usize) -> Self {
        Self {
            image: Arc::from(image),
            base,
            len,
        }
    }

    /// Smallest region spanning every address in `addresses`.
    pub fn covering(image: &str, addresses: &[usize]) -> Self {
        let low = addresses.iter().copied().min().unwrap_or(0);
        let high = addresses.iter().copied().max().unwrap_or(0);
        Self::new(image, low, (high - low).saturating_add(1))
    }

    #[inline]
    pub fn contains(&self, address: usize, len: usize) -> bool {
        let (Some(end), Some(limit)) = (address.checked_add(len), self.base.checked_add(self.len))
        else {
            return false;
        };
        address >= self.base && end <= limit
    }
}

#[derive(Debug, Default)]
pub struct CodeSpace {
    regions: RwLock<Vec<CodeRegion>>,
}

impl CodeSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, region: CodeRegion) {
        log::debug!(
            "code region {} at 0x{:x}+{}",
            region.image,
            region.base,
            region.len
        );
        self.regions.write().push(region);
    }

    /// Replaces the region of `image`, e.g. after the image was loaded elsewhere.
    pub fn rebase(&self, image: &str, base: usize, len: usize) {
        let mut regions = self.regions.write();
        regions.retain(|r| &*r.image != image);
        regions.push(CodeRegion::new(image, base, len));
    }

    pub fn resolve(&self, address: usize, len: usize) -> Option<(Arc<str>, usize)> {
        self.regions
            .read()
            .iter()
            .find(|r| r.contains(address, len))
            .map(|r| (r.image.clone(), address - r.base))
    }

    pub fn regions(&self) -> Vec<CodeRegion> {
        self.regions.read().clone()
    }
}

/// New load position of each image after a reload.
#[derive(Debug, Clone, Default)]
pub struct RelocationMap {
    images: HashMap<Arc<str>, (usize, usize), ahash::RandomState>,
}

impl RelocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: &str, base: usize, len: usize) -> &mut Self {
        self.images.insert(Arc::from(image), (base, len));
        self
    }

    pub fn get(&self, image: &str) -> Option<(usize, usize)> {
        self.images.get(image).copied()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug)]
pub struct CodePointerCell {
    address: AtomicUsize,
    len: usize,
    image: Arc<str>,
    offset: usize,
}

impl CodePointerCell {
    /// Validates `address..address + len` against the instrumented regions.
    pub fn validate(
        function: &str,
        address: usize,
        len: usize,
        space: &CodeSpace,
    ) -> Result<Self, CodeError> {
        if address == 0 {
            return Err(CodeError::Null {
                function: function.to_string(),
            });
        }
        let (image, offset) =
            space
                .resolve(address, len)
                .ok_or_else(|| CodeError::NotInstrumented {
                    function: function.to_string(),
                    address,
                    len,
                })?;
        Ok(Self {
            address: AtomicUsize::new(address),
            len,
            image,
            offset,
        })
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Points the cell at the same offset inside the relocated image.
    /// Returns whether the address changed.
    pub fn fixup(&self, function: &str, map: &RelocationMap) -> Result<bool, RelocationError> {
        let relocated = self.relocated_address(function, map)?;
        let previous = self.address.swap(relocated, Ordering::AcqRel);
        Ok(previous != relocated)
    }

    /// Where `map` would move this cell, without moving it.
    pub fn relocated_address(
        &self,
        function: &str,
        map: &RelocationMap,
    ) -> Result<usize, RelocationError> {
        let Some((base, image_len)) = map.get(&self.image) else {
            return Err(RelocationError::UnknownImage {
                function: function.to_string(),
                image: self.image.to_string(),
                address: self.address(),
            });
        };
        let out_of_range = || RelocationError::OutOfRange {
            function: function.to_string(),
            image: self.image.to_string(),
            offset: self.offset,
            len: self.len,
            image_len,
        };
        if self
            .offset
            .checked_add(self.len)
            .is_none_or(|end| end > image_len)
        {
            return Err(out_of_range());
        }
        base.checked_add(self.offset).ok_or_else(out_of_range)
    }
}
