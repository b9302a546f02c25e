//! Conversions between PLC memory encodings and native values.
//!
//! Every accessor takes a buffer and a byte index. Multi-byte values are big-endian.
//! Accessors never panic on short buffers, they return [CodecError::OutOfBounds].
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::CodecError;

const BIT_MASK: [u8; 8] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80];
const MAX_STRING_LEN: usize = 254;
const MAX_WSTRING_LEN: usize = 16382;
const MS_PER_DAY: u32 = 86_400_000;

fn read<const N: usize>(buffer: &[u8], index: usize) -> Result<[u8; N], CodecError> {
    buffer
        .get(index..index + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(CodecError::OutOfBounds {
            index,
            needed: N,
            len: buffer.len(),
        })
}

fn slot(buffer: &mut [u8], index: usize, needed: usize) -> Result<&mut [u8], CodecError> {
    let len = buffer.len();
    buffer
        .get_mut(index..index + needed)
        .ok_or(CodecError::OutOfBounds { index, needed, len })
}

fn write<const N: usize>(buffer: &mut [u8], index: usize, bytes: [u8; N]) -> Result<(), CodecError> {
    slot(buffer, index, N)?.copy_from_slice(&bytes);
    Ok(())
}

fn invalid(reason: impl Into<String>) -> CodecError {
    CodecError::InvalidValue(reason.into())
}

pub fn bcd_to_byte(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

pub fn byte_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Reads bit `bit` of the byte at `index`. Bit indexes above 7 are clamped to 7.
pub fn get_bit(buffer: &[u8], index: usize, bit: u8) -> Result<bool, CodecError> {
    let [byte] = read::<1>(buffer, index)?;
    Ok(byte & BIT_MASK[bit.min(7) as usize] != 0)
}

/// Sets bit `bit` of the byte at `index`. Bit indexes above 7 are clamped to 7.
pub fn set_bit(buffer: &mut [u8], index: usize, bit: u8, value: bool) -> Result<(), CodecError> {
    let byte = &mut slot(buffer, index, 1)?[0];
    let mask = BIT_MASK[bit.min(7) as usize];
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
    Ok(())
}

pub fn get_byte(buffer: &[u8], index: usize) -> Result<u8, CodecError> {
    read::<1>(buffer, index).map(|[b]| b)
}

pub fn set_byte(buffer: &mut [u8], index: usize, value: u8) -> Result<(), CodecError> {
    write(buffer, index, [value])
}

pub fn get_usint(buffer: &[u8], index: usize) -> Result<u8, CodecError> {
    get_byte(buffer, index)
}

pub fn set_usint(buffer: &mut [u8], index: usize, value: u8) -> Result<(), CodecError> {
    set_byte(buffer, index, value)
}

pub fn get_sint(buffer: &[u8], index: usize) -> Result<i8, CodecError> {
    read(buffer, index).map(i8::from_be_bytes)
}

pub fn set_sint(buffer: &mut [u8], index: usize, value: i8) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_word(buffer: &[u8], index: usize) -> Result<u16, CodecError> {
    read(buffer, index).map(u16::from_be_bytes)
}

pub fn set_word(buffer: &mut [u8], index: usize, value: u16) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_uint(buffer: &[u8], index: usize) -> Result<u16, CodecError> {
    get_word(buffer, index)
}

pub fn set_uint(buffer: &mut [u8], index: usize, value: u16) -> Result<(), CodecError> {
    set_word(buffer, index, value)
}

pub fn get_int(buffer: &[u8], index: usize) -> Result<i16, CodecError> {
    read(buffer, index).map(i16::from_be_bytes)
}

pub fn set_int(buffer: &mut [u8], index: usize, value: i16) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_dword(buffer: &[u8], index: usize) -> Result<u32, CodecError> {
    read(buffer, index).map(u32::from_be_bytes)
}

pub fn set_dword(buffer: &mut [u8], index: usize, value: u32) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_udint(buffer: &[u8], index: usize) -> Result<u32, CodecError> {
    get_dword(buffer, index)
}

pub fn set_udint(buffer: &mut [u8], index: usize, value: u32) -> Result<(), CodecError> {
    set_dword(buffer, index, value)
}

pub fn get_dint(buffer: &[u8], index: usize) -> Result<i32, CodecError> {
    read(buffer, index).map(i32::from_be_bytes)
}

pub fn set_dint(buffer: &mut [u8], index: usize, value: i32) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_lword(buffer: &[u8], index: usize) -> Result<u64, CodecError> {
    read(buffer, index).map(u64::from_be_bytes)
}

pub fn set_lword(buffer: &mut [u8], index: usize, value: u64) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_ulint(buffer: &[u8], index: usize) -> Result<u64, CodecError> {
    get_lword(buffer, index)
}

pub fn set_ulint(buffer: &mut [u8], index: usize, value: u64) -> Result<(), CodecError> {
    set_lword(buffer, index, value)
}

pub fn get_lint(buffer: &[u8], index: usize) -> Result<i64, CodecError> {
    read(buffer, index).map(i64::from_be_bytes)
}

pub fn set_lint(buffer: &mut [u8], index: usize, value: i64) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_real(buffer: &[u8], index: usize) -> Result<f32, CodecError> {
    read(buffer, index).map(f32::from_be_bytes)
}

pub fn set_real(buffer: &mut [u8], index: usize, value: f32) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_lreal(buffer: &[u8], index: usize) -> Result<f64, CodecError> {
    read(buffer, index).map(f64::from_be_bytes)
}

pub fn set_lreal(buffer: &mut [u8], index: usize, value: f64) -> Result<(), CodecError> {
    write(buffer, index, value.to_be_bytes())
}

pub fn get_char(buffer: &[u8], index: usize) -> Result<char, CodecError> {
    get_byte(buffer, index).map(char::from)
}

pub fn set_char(buffer: &mut [u8], index: usize, value: char) -> Result<(), CodecError> {
    if !value.is_ascii() {
        return Err(invalid(format!("'{}' is not an ASCII character", value)));
    }
    set_byte(buffer, index, value as u8)
}

pub fn get_wchar(buffer: &[u8], index: usize) -> Result<char, CodecError> {
    let unit = get_word(buffer, index)?;
    char::from_u32(unit as u32).ok_or_else(|| invalid(format!("0x{:04X} is not a character", unit)))
}

pub fn set_wchar(buffer: &mut [u8], index: usize, value: char) -> Result<(), CodecError> {
    let mut units = [0u16; 2];
    match value.encode_utf16(&mut units) {
        [unit] => set_word(buffer, index, *unit),
        _ => Err(invalid(format!("'{}' does not fit a single WCHAR", value))),
    }
}

/// Reads a STRING: declared max length, current length and ASCII payload.
pub fn get_string(buffer: &[u8], index: usize) -> Result<String, CodecError> {
    let [max_len, len] = read::<2>(buffer, index)?;
    if len > max_len || max_len as usize > MAX_STRING_LEN {
        return Err(invalid(format!(
            "String contains {} chars, but max. {} chars are expected or is larger than {}",
            len, max_len, MAX_STRING_LEN
        )));
    }
    let start = index + 2;
    let payload = buffer
        .get(start..start + len as usize)
        .ok_or(CodecError::OutOfBounds {
            index: start,
            needed: len as usize,
            len: buffer.len(),
        })?;
    Ok(payload.iter().copied().map(char::from).collect())
}

/// Writes a STRING with declared maximum `max_len`.
pub fn set_string(
    buffer: &mut [u8],
    index: usize,
    value: &str,
    max_len: usize,
) -> Result<(), CodecError> {
    if max_len > MAX_STRING_LEN {
        return Err(invalid(format!(
            "max_len {} > max. allowed {} chars",
            max_len, MAX_STRING_LEN
        )));
    }
    if !value.is_ascii() {
        return Err(invalid(
            "Value contains non-ascii characters, use a WSTRING instead",
        ));
    }
    if value.len() > max_len {
        return Err(invalid(format!(
            "String of {} chars exceeds max_len {}",
            value.len(),
            max_len
        )));
    }
    let target = slot(buffer, index, 2 + value.len())?;
    target[0] = max_len as u8;
    target[1] = value.len() as u8;
    target[2..].copy_from_slice(value.as_bytes());
    Ok(())
}

/// Reads a space padded, fixed length ASCII string.
pub fn get_fstring(
    buffer: &[u8],
    index: usize,
    len: usize,
    remove_padding: bool,
) -> Result<String, CodecError> {
    let raw = buffer.get(index..index + len).ok_or(CodecError::OutOfBounds {
        index,
        needed: len,
        len: buffer.len(),
    })?;
    let text: String = raw.iter().copied().map(char::from).collect();
    if remove_padding {
        Ok(text.trim_end_matches(' ').to_string())
    } else {
        Ok(text)
    }
}

pub fn set_fstring(
    buffer: &mut [u8],
    index: usize,
    value: &str,
    len: usize,
) -> Result<(), CodecError> {
    if !value.is_ascii() {
        return Err(invalid("Value contains non-ascii characters"));
    }
    if value.len() > len {
        return Err(invalid(format!(
            "String of {} chars exceeds fixed length {}",
            value.len(),
            len
        )));
    }
    let target = slot(buffer, index, len)?;
    target.fill(b' ');
    target[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

/// Reads a WSTRING: declared max chars, used chars and UTF-16BE payload.
pub fn get_wstring(buffer: &[u8], index: usize) -> Result<String, CodecError> {
    let max_chars = get_word(buffer, index)? as usize;
    let used_chars = get_word(buffer, index + 2)? as usize;
    if used_chars > max_chars || max_chars > MAX_WSTRING_LEN {
        return Err(invalid(format!(
            "WString contains {} chars, but max {} chars are expected or is larger than {}",
            used_chars, max_chars, MAX_WSTRING_LEN
        )));
    }
    let start = index + 4;
    let payload = buffer
        .get(start..start + used_chars * 2)
        .ok_or(CodecError::OutOfBounds {
            index: start,
            needed: used_chars * 2,
            len: buffer.len(),
        })?;
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| invalid(format!("Invalid UTF-16: {}", e)))
}

pub fn set_wstring(
    buffer: &mut [u8],
    index: usize,
    value: &str,
    max_chars: usize,
) -> Result<(), CodecError> {
    if max_chars > MAX_WSTRING_LEN {
        return Err(invalid(format!(
            "max_chars {} > max. allowed {}",
            max_chars, MAX_WSTRING_LEN
        )));
    }
    let units: Vec<u16> = value.encode_utf16().collect();
    if units.len() > max_chars {
        return Err(invalid(format!(
            "WString of {} chars exceeds max_chars {}",
            units.len(),
            max_chars
        )));
    }
    let target = slot(buffer, index, 4 + units.len() * 2)?;
    target[0..2].copy_from_slice(&(max_chars as u16).to_be_bytes());
    target[2..4].copy_from_slice(&(units.len() as u16).to_be_bytes());
    for (chunk, unit) in target[4..].chunks_exact_mut(2).zip(units) {
        chunk.copy_from_slice(&unit.to_be_bytes());
    }
    Ok(())
}

fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}

/// Reads a DATE (days since 1990-01-01).
pub fn get_date(buffer: &[u8], index: usize) -> Result<NaiveDate, CodecError> {
    let days = get_word(buffer, index)?;
    let date = date_epoch()
        .checked_add_days(chrono::Days::new(days as u64))
        .ok_or_else(|| invalid("Date out of range"))?;
    if date > last_date() {
        return Err(invalid("Date is higher than 2168-12-31"));
    }
    Ok(date)
}

fn last_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2168, 12, 31).unwrap_or_default()
}

pub fn set_date(buffer: &mut [u8], index: usize, value: NaiveDate) -> Result<(), CodecError> {
    if value < date_epoch() || value > last_date() {
        return Err(invalid(format!(
            "Date {} outside of 1990-01-01..=2168-12-31",
            value
        )));
    }
    let days = (value - date_epoch()).num_days() as u16;
    set_word(buffer, index, days)
}

/// Reads a TIME_OF_DAY (milliseconds since midnight).
pub fn get_tod(buffer: &[u8], index: usize) -> Result<NaiveTime, CodecError> {
    let ms = get_dword(buffer, index)?;
    if ms >= MS_PER_DAY {
        return Err(invalid(format!("{} ms is not a time of day", ms)));
    }
    NaiveTime::from_num_seconds_from_midnight_opt(ms / 1000, (ms % 1000) * 1_000_000)
        .ok_or_else(|| invalid("Invalid time of day"))
}

pub fn set_tod(buffer: &mut [u8], index: usize, value: NaiveTime) -> Result<(), CodecError> {
    let ms = value.num_seconds_from_midnight() * 1000 + value.nanosecond() / 1_000_000;
    set_dword(buffer, index, ms)
}

/// Reads a TIME as signed milliseconds.
pub fn get_time(buffer: &[u8], index: usize) -> Result<i32, CodecError> {
    get_dint(buffer, index)
}

pub fn set_time(buffer: &mut [u8], index: usize, ms: i32) -> Result<(), CodecError> {
    set_dint(buffer, index, ms)
}

/// Renders a TIME value as `[-]D:H:M:S.mmm`.
pub fn format_time(ms: i32) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let value = (ms as i64).abs();
    let millis = value % 1000;
    let seconds = value / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    format!(
        "{}{}:{}:{}:{}.{:03}",
        sign,
        days,
        hours % 24,
        minutes % 60,
        seconds % 60,
        millis
    )
}

/// Parses the `[-]D:H:M:S.mmm` text form of a TIME value.
pub fn parse_time(text: &str) -> Result<i32, CodecError> {
    let bad = || invalid(format!("'{}' is not a valid time value", text));
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = body.split_once('.').ok_or_else(bad)?;
    let fields: Vec<&str> = clock.split(':').collect();
    let &[days, hours, minutes, seconds] = fields.as_slice() else {
        return Err(bad());
    };
    if fraction.is_empty() || fraction.len() > 3 {
        return Err(bad());
    }
    let parse = |s: &str| s.parse::<u32>().map(i64::from).map_err(|_| bad());
    let (days, hours, minutes, seconds) =
        (parse(days)?, parse(hours)?, parse(minutes)?, parse(seconds)?);
    if hours > 23 || minutes > 59 || seconds > 59 {
        return Err(bad());
    }
    let millis = parse(&format!("{:0<3}", fraction))?;
    let total = ((days * 24 + hours) * 60 + minutes) * 60_000 + seconds * 1000 + millis;
    let total = if negative { -total } else { total };
    i32::try_from(total).map_err(|_| invalid("time value out of range"))
}

/// Reads a DATE_AND_TIME (8 BCD bytes). The day-of-week nibble is ignored.
pub fn get_date_time(buffer: &[u8], index: usize) -> Result<NaiveDateTime, CodecError> {
    let b = read::<8>(buffer, index)?;
    let year = bcd_to_byte(b[0]) as i32;
    let year = if year < 90 { 2000 + year } else { 1900 + year };
    let millis = bcd_to_byte(b[6]) as u32 * 10 + bcd_to_byte(b[7]) as u32 / 10;
    NaiveDate::from_ymd_opt(year, bcd_to_byte(b[1]) as u32, bcd_to_byte(b[2]) as u32)
        .and_then(|date| {
            date.and_hms_milli_opt(
                bcd_to_byte(b[3]) as u32,
                bcd_to_byte(b[4]) as u32,
                bcd_to_byte(b[5]) as u32,
                millis,
            )
        })
        .ok_or_else(|| invalid(format!("Invalid DATE_AND_TIME {:02x?}", b)))
}

/// Writes a DATE_AND_TIME. Years must lie in 1990..=2089.
pub fn set_date_time(
    buffer: &mut [u8],
    index: usize,
    value: NaiveDateTime,
) -> Result<(), CodecError> {
    if !(1990..=2089).contains(&value.year()) {
        return Err(invalid(format!(
            "Year {} cannot be encoded in DATE_AND_TIME",
            value.year()
        )));
    }
    let millis = value.and_utc().timestamp_subsec_millis();
    let weekday = value.weekday().number_from_sunday() as u8;
    write(
        buffer,
        index,
        [
            byte_to_bcd((value.year() % 100) as u8),
            byte_to_bcd(value.month() as u8),
            byte_to_bcd(value.day() as u8),
            byte_to_bcd(value.hour() as u8),
            byte_to_bcd(value.minute() as u8),
            byte_to_bcd(value.second() as u8),
            byte_to_bcd((millis / 10) as u8),
            byte_to_bcd(((millis % 10) * 10) as u8 + weekday),
        ],
    )
}

/// Reads a DTL (12 bytes, nanosecond resolution).
pub fn get_dtl(buffer: &[u8], index: usize) -> Result<NaiveDateTime, CodecError> {
    let b = read::<12>(buffer, index)?;
    let year = u16::from_be_bytes([b[0], b[1]]) as i32;
    let nanos = u32::from_be_bytes([b[8], b[9], b[10], b[11]]);
    NaiveDate::from_ymd_opt(year, b[2] as u32, b[3] as u32)
        .and_then(|date| date.and_hms_nano_opt(b[5] as u32, b[6] as u32, b[7] as u32, nanos))
        .ok_or_else(|| invalid(format!("Invalid DTL {:02x?}", b)))
}

pub fn set_dtl(buffer: &mut [u8], index: usize, value: NaiveDateTime) -> Result<(), CodecError> {
    let year = u16::try_from(value.year()).map_err(|_| invalid("Year out of range"))?;
    let [y0, y1] = year.to_be_bytes();
    let [n0, n1, n2, n3] = value.nanosecond().to_be_bytes();
    write(
        buffer,
        index,
        [
            y0,
            y1,
            value.month() as u8,
            value.day() as u8,
            value.weekday().number_from_sunday() as u8,
            value.hour() as u8,
            value.minute() as u8,
            value.second() as u8,
            n0,
            n1,
            n2,
            n3,
        ],
    )
}

const S5_BASES_MS: [u64; 4] = [10, 100, 1000, 10_000];

/// Reads an S5TIME: time base in the top nibble, 3 BCD digits of count.
pub fn get_s5time(buffer: &[u8], index: usize) -> Result<Duration, CodecError> {
    let raw = get_word(buffer, index)?;
    let base = (raw >> 12) as usize;
    let base_ms = *S5_BASES_MS
        .get(base)
        .ok_or_else(|| invalid(format!("S5TIME time base {} is greater than 3", base)))?;
    let digits = [(raw >> 8) & 0x0F, (raw >> 4) & 0x0F, raw & 0x0F];
    if digits.iter().any(|d| *d > 9) {
        return Err(invalid(format!("S5TIME 0x{:04X} is not BCD", raw)));
    }
    let count = digits[0] as u64 * 100 + digits[1] as u64 * 10 + digits[2] as u64;
    Ok(Duration::from_millis(base_ms * count))
}

/// Writes an S5TIME using the finest time base that can hold `value`.
pub fn set_s5time(buffer: &mut [u8], index: usize, value: Duration) -> Result<(), CodecError> {
    let ms = value.as_millis() as u64;
    let (base, count) = S5_BASES_MS
        .iter()
        .enumerate()
        .map(|(base, base_ms)| (base as u16, ms / base_ms))
        .find(|(_, count)| *count <= 999)
        .ok_or_else(|| invalid(format!("{} ms exceeds the S5TIME range", ms)))?;
    let count = count as u16;
    let raw = (base << 12) | ((count / 100) << 8) | (((count / 10) % 10) << 4) | (count % 10);
    set_word(buffer, index, raw)
}

/// Reads a counter value (3 BCD digits).
pub fn get_counter(buffer: &[u8], index: usize) -> Result<u16, CodecError> {
    let [hi, lo] = read::<2>(buffer, index)?;
    if hi & 0x0F > 9 || lo >> 4 > 9 || lo & 0x0F > 9 {
        return Err(invalid(format!("Counter 0x{:02X}{:02X} is not BCD", hi, lo)));
    }
    Ok((hi & 0x0F) as u16 * 100 + bcd_to_byte(lo) as u16)
}

pub fn set_counter(buffer: &mut [u8], index: usize, value: u16) -> Result<(), CodecError> {
    if value > 999 {
        return Err(invalid(format!("Counter value {} exceeds 999", value)));
    }
    write(
        buffer,
        index,
        [byte_to_bcd((value / 100) as u8), byte_to_bcd((value % 100) as u8)],
    )
}

/// State of an IEC timer instance.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IecTimer {
    /// Preset time
    pub pt: Duration,
    /// Elapsed time
    pub et: Duration,
    pub input: bool,
    pub q: bool,
}

/// Reads a 12 byte IEC timer record.
pub fn get_iec_timer(buffer: &[u8], index: usize) -> Result<IecTimer, CodecError> {
    let b = read::<12>(buffer, index)?;
    Ok(IecTimer {
        pt: Duration::from_millis(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64),
        et: Duration::from_millis(u32::from_be_bytes([b[4], b[5], b[6], b[7]]) as u64),
        input: b[8] & 0x01 != 0,
        q: b[8] & 0x02 != 0,
    })
}
