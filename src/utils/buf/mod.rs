mod chained_buf;

pub use chained_buf::*;
