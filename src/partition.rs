//! Splitting the universe into regional worlds.
//!
//! Ranks are dealt round-robin: with `R` regions, universe rank `i` joins region `i % R`,
//! so region `r` is the strided arch `{r, r + R, r + 2R, ...}`. Region sizes differ by at
//! most one and every rank lands in exactly one region.

use crate::arch::StridedArch;
use crate::world::World;
use crate::Error;

/// The region universe rank `pe` belongs to
pub fn region_of(pe: usize, num_regions: usize) -> usize {
    pe % num_regions
}

/// The arch of region `region` when `num_pes` ranks are split into `num_regions` regions
pub fn region_arch(num_pes: usize, num_regions: usize, region: usize) -> StridedArch {
    let size = if region < num_pes % num_regions {
        num_pes / num_regions + 1
    } else {
        num_pes / num_regions
    };
    StridedArch::new(region, num_regions, size)
}

/// The universe ranks of region `region`, in regional pe order
pub fn region_members(num_pes: usize, num_regions: usize, region: usize) -> Vec<usize> {
    (region..num_pes).step_by(num_regions.max(1)).collect()
}

pub(crate) fn check_num_regions(num_pes: usize, num_regions: usize) -> Result<(), Error> {
    if num_regions == 0 || num_regions > num_pes {
        Err(Error::FatalConfiguration(format!(
            "the number of regions must be between 1 and the universe size ({}), got {}",
            num_pes, num_regions
        )))
    } else {
        Ok(())
    }
}

/// Collective over `universe`: creates the `num_regions` regional worlds and returns the one
/// containing the calling rank. A universe barrier follows the creation.
///
/// Fails with [Error::FatalConfiguration] on every rank when `num_regions` is 0 or larger than
/// the universe.
#[tracing::instrument(skip(universe))]
pub fn create_regions(universe: &World, num_regions: usize) -> Result<World, Error> {
    let num_pes = universe.num_pes();
    check_num_regions(num_pes, num_regions)?;
    let archs = (0..num_regions)
        .map(|region| region_arch(num_pes, num_regions, region))
        .collect::<Vec<_>>();
    let region = universe.create_subworlds(archs)?;
    tracing::debug!(
        region = region_of(universe.my_pe(), num_regions),
        region_pe = region.my_pe(),
        region_size = region.num_pes(),
        "joined region"
    );
    Ok(region)
}
