pub mod cms;
pub mod error;
pub mod hash;
pub mod hyperloglog;
pub mod table;

mod logcell;

pub use cms::{
    CellCodec, Cms32, Cms64, CmsLog1024, CmsLog8, CountMin, Linear32, Linear64, Log1024, Log8,
    SketchDump,
};
pub use error::Error;
pub use hyperloglog::HyperLogLog;
pub use table::{BoundedCounter, TableDump, TableParams};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Largest power of two not exceeding `value`, with 0 mapping to 1.
pub(crate) fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        1
    } else {
        1 << (63 - value.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::floor_power_of_two;

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(floor_power_of_two(0), 1);
        assert_eq!(floor_power_of_two(1), 1);
        assert_eq!(floor_power_of_two(2), 2);
        assert_eq!(floor_power_of_two(3), 2);
        assert_eq!(floor_power_of_two(1000), 512);
        assert_eq!(floor_power_of_two(1024), 1024);
        assert_eq!(floor_power_of_two(u64::MAX), 1 << 63);
    }
}
