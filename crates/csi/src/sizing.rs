//! Capacity-range normalization shared by `CreateVolume` and
//! `ControllerExpandVolume`/`NodeExpandVolume`.

use tonic::Status;

use crate::csi::v1::CapacityRange;
use crate::MIN_VOLUME_SIZE_GB;

const GIB: i64 = 1 << 30;

/// Round a byte count up to whole gigabytes.
pub fn gib_ceil(bytes: i64) -> u32 {
    (((bytes + GIB - 1) / GIB).max(0)) as u32
}

pub fn gb_to_bytes(size_gb: u32) -> i64 {
    size_gb as i64 * GIB
}

/// Apply the capacity-range rule, returning the effective
/// size in whole gigabytes.
pub fn effective_size_gb(range: Option<CapacityRange>) -> Result<u32, Status> {
    let Some(range) = range else {
        return Ok(MIN_VOLUME_SIZE_GB);
    };

    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Status::invalid_argument(
            "capacity_range values must be non-negative",
        ));
    }
    if range.required_bytes == 0 && range.limit_bytes == 0 {
        return Err(Status::invalid_argument(
            "capacity_range requires at least one of required_bytes/limit_bytes",
        ));
    }

    if range.limit_bytes == 0 {
        return Ok(gib_ceil(range.required_bytes).max(MIN_VOLUME_SIZE_GB));
    }

    let limit_gb = gib_ceil(range.limit_bytes);
    if limit_gb < MIN_VOLUME_SIZE_GB {
        return Err(Status::invalid_argument(
            "limit_bytes is below the minimum volume size",
        ));
    }

    if range.required_bytes == 0 {
        return Ok(limit_gb);
    }

    let required_gb = gib_ceil(range.required_bytes);
    if required_gb > limit_gb {
        return Err(Status::invalid_argument(
            "required_bytes exceeds limit_bytes",
        ));
    }

    Ok(required_gb.max(limit_gb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_range_defaults_to_minimum() {
        assert_eq!(effective_size_gb(None).unwrap(), MIN_VOLUME_SIZE_GB);
    }

    #[test]
    fn both_zero_is_rejected() {
        let range = CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        assert!(effective_size_gb(Some(range)).is_err());
    }

    #[test]
    fn sub_minimum_required_bumps_to_floor() {
        let range = CapacityRange {
            required_bytes: gb_to_bytes(MIN_VOLUME_SIZE_GB) - 1,
            limit_bytes: 0,
        };
        assert_eq!(effective_size_gb(Some(range)).unwrap(), MIN_VOLUME_SIZE_GB);
    }

    #[test]
    fn required_above_limit_is_rejected() {
        let range = CapacityRange {
            required_bytes: gb_to_bytes(20),
            limit_bytes: gb_to_bytes(15),
        };
        assert!(effective_size_gb(Some(range)).is_err());
    }

    #[test]
    fn limit_below_minimum_is_rejected() {
        let range = CapacityRange {
            required_bytes: 0,
            limit_bytes: gb_to_bytes(5),
        };
        assert!(effective_size_gb(Some(range)).is_err());
    }
}
