use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;

/// Calendar interval; durations use `nanos` only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntervalParts {
    pub months: i32,
    pub days: i32,
    pub nanos: i64,
}

impl IntervalParts {
    /// Reassembles one month-day-nano interval from its four raw 32-bit
    /// words: months, days, then the low and high halves of nanoseconds.
    pub fn from_words(words: [u32; 4]) -> Self {
        let [months, days, low, high] = words;
        Self {
            months: months as i32,
            days: days as i32,
            nanos: i64::from(low) + (i64::from(high as i32) << 32),
        }
    }

    /// Reads the interval of `row` from a month-day-nano value buffer.
    pub fn from_le_bytes(buffer: &[u8], row: usize) -> Option<Self> {
        let start = row.checked_mul(16)?;
        let bytes = buffer.get(start..start + 16)?;
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self::from_words(words))
    }
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_timestamp(value: &NaiveDateTime, utc: bool) -> String {
    let mut text = value.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
    if utc {
        text.push('Z');
    }
    text
}

pub fn format_time(time: &NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

/// Human form such as `1 year 2 months 3 days 4 hours 5 minutes 6500ms`.
/// Zero components are left out; seconds use the coarsest unit that keeps
/// the sub-second remainder exact.
pub fn format_interval(parts: &IntervalParts) -> String {
    let mut out = Vec::new();
    let years = parts.months / 12;
    let months = parts.months % 12;
    push_unit(&mut out, i64::from(years), "year");
    push_unit(&mut out, i64::from(months), "month");
    push_unit(&mut out, i64::from(parts.days), "day");

    let hours = parts.nanos / NANOS_PER_HOUR;
    let minutes = (parts.nanos % NANOS_PER_HOUR) / NANOS_PER_MINUTE;
    let rest = parts.nanos % NANOS_PER_MINUTE;
    push_unit(&mut out, hours, "hour");
    push_unit(&mut out, minutes, "minute");
    if rest != 0 {
        out.push(if rest % NANOS_PER_SECOND == 0 {
            format!("{}s", rest / NANOS_PER_SECOND)
        } else if rest % NANOS_PER_MILLI == 0 {
            format!("{}ms", rest / NANOS_PER_MILLI)
        } else if rest % NANOS_PER_MICRO == 0 {
            format!("{}us", rest / NANOS_PER_MICRO)
        } else {
            format!("{rest}ns")
        });
    }

    if out.is_empty() {
        return "0s".to_string();
    }
    out.join(" ")
}

fn push_unit(out: &mut Vec<String>, value: i64, unit: &str) {
    match value {
        0 => {}
        1 | -1 => out.push(format!("{value} {unit}")),
        _ => out.push(format!("{value} {unit}s")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(months: i32, days: i32, nanos: i64) -> String {
        format_interval(&IntervalParts {
            months,
            days,
            nanos,
        })
    }

    #[test]
    fn interval_components() {
        assert_eq!(interval(0, 0, 0), "0s");
        assert_eq!(interval(14, 3, 0), "1 year 2 months 3 days");
        assert_eq!(
            interval(0, 0, NANOS_PER_HOUR + 30 * NANOS_PER_MINUTE + 5 * NANOS_PER_SECOND),
            "1 hour 30 minutes 5s"
        );
        assert_eq!(interval(0, 1, 1_500 * NANOS_PER_MILLI), "1 day 1500ms");
        assert_eq!(interval(0, 0, 2_000_001_000), "2000001us");
        assert_eq!(interval(0, 0, 7), "7ns");
        assert_eq!(interval(-1, 0, 0), "-1 month");
    }

    #[test]
    fn raw_words_rebuild_nanoseconds() {
        let nanos: i64 = 5 * NANOS_PER_HOUR;
        let words = [
            2,
            10,
            (nanos as u64 & 0xffff_ffff) as u32,
            ((nanos as u64) >> 32) as u32,
        ];
        let parts = IntervalParts::from_words(words);
        assert_eq!(
            parts,
            IntervalParts {
                months: 2,
                days: 10,
                nanos
            }
        );

        let negative = -NANOS_PER_SECOND;
        let parts = IntervalParts::from_words([
            0,
            0,
            (negative as u64 & 0xffff_ffff) as u32,
            ((negative as u64) >> 32) as u32,
        ]);
        assert_eq!(parts.nanos, negative);
    }

    #[test]
    fn reads_rows_from_buffer() {
        let mut buffer = Vec::new();
        for (months, days, nanos) in [(1i32, 2i32, 3i64), (4, 5, 6_000_000_000)] {
            buffer.extend_from_slice(&months.to_le_bytes());
            buffer.extend_from_slice(&days.to_le_bytes());
            buffer.extend_from_slice(&nanos.to_le_bytes());
        }
        let second = IntervalParts::from_le_bytes(&buffer, 1).expect("row 1");
        assert_eq!(format_interval(&second), "4 months 5 days 6s");
        assert!(IntervalParts::from_le_bytes(&buffer, 2).is_none());
    }

    #[test]
    fn temporal_iso_strings() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
        assert_eq!(format_date(&date), "2024-02-29");
        let ts = date.and_hms_milli_opt(13, 5, 9, 250).expect("ts");
        assert_eq!(format_timestamp(&ts, true), "2024-02-29T13:05:09.250Z");
        let ts = date.and_hms_opt(0, 0, 0).expect("ts");
        assert_eq!(format_timestamp(&ts, false), "2024-02-29T00:00:00");
        let time = NaiveTime::from_hms_micro_opt(23, 59, 1, 5).expect("time");
        assert_eq!(format_time(&time), "23:59:01.000005");
    }
}
