//! `Range` header parsing. One `bytes=a-b` or `bytes=a-` range only.

use odrive_core::ByteRange;

use crate::error::{ObjectError, ObjectResult};

/// Parse a `Range` header value. `None` (no header) reads everything.
///
/// Multiple ranges, suffix ranges (`bytes=-n`), other units, and inverted
/// bounds are all rejected as not satisfiable.
pub fn parse_range(header: Option<&str>) -> ObjectResult<ByteRange> {
    let Some(raw) = header else {
        return Ok(ByteRange::full());
    };
    let bad = || ObjectError::RangeNotSatisfiable(raw.to_string());

    let value = raw.trim().strip_prefix("bytes=").ok_or_else(bad)?;
    if value.contains(',') {
        return Err(bad());
    }
    let (start, stop) = value.split_once('-').ok_or_else(bad)?;
    let start: u64 = start.trim().parse().map_err(|_| bad())?;
    let stop = match stop.trim() {
        "" => None,
        s => Some(s.parse::<u64>().map_err(|_| bad())?),
    };
    if stop.is_some_and(|stop| stop < start) {
        return Err(bad());
    }
    Ok(ByteRange::new(start, stop))
}
