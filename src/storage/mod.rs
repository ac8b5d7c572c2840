mod range_set;

pub use self::range_set::RangeSet;
