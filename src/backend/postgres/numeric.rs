//! `NUMERIC` binary wire format
//!
//! Layout: `ndigits: i16, weight: i16, sign: u16, dscale: u16`, then `ndigits` base-10000
//! groups as `i16`. `weight` is the base-10000 exponent of the first group.

use std::error::Error;
use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use tokio_postgres::types::{FromSql, Type};

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_POS_INFINITY: u16 = 0xD000;
const SIGN_NEG_INFINITY: u16 = 0xF000;

const MAX_DSCALE: i64 = 0x3FFF;
/// Decimal digits allowed before the point
const MAX_INT_DIGITS: i64 = 131_072;

type BoxError = Box<dyn Error + Sync + Send>;

/// Decimal text decoded from a `NUMERIC` column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric(pub String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Encode decimal text (`-12.50`, `1e-3`) into the binary format
pub fn encode(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let text = text.trim();
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    match unsigned {
        "NaN" => return write_special(out, SIGN_NAN),
        "Infinity" if negative => return write_special(out, SIGN_NEG_INFINITY),
        "Infinity" => return write_special(out, SIGN_POS_INFINITY),
        _ => {}
    }

    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], unsigned[pos + 1..].parse::<i64>()?),
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("invalid numeric literal '{text}'").into());
    }

    let digits: Vec<i16> = int_part
        .bytes()
        .chain(frac_part.bytes())
        .map(|b| {
            if b.is_ascii_digit() {
                Ok(i16::from(b - b'0'))
            } else {
                Err(format!("invalid numeric literal '{text}'"))
            }
        })
        .collect::<Result<_, _>>()?;

    let out_of_range = || format!("numeric value '{text}' is out of range");
    let scale = i64::try_from(frac_part.len())?
        .checked_sub(exponent)
        .ok_or_else(out_of_range)?
        .max(0);
    if scale > MAX_DSCALE {
        return Err(format!("numeric scale of '{text}' is out of range").into());
    }

    // decimal exponent of digit k is point - 1 - k
    let point = i64::try_from(int_part.len())?
        .checked_add(exponent)
        .ok_or_else(out_of_range)?;
    if point > MAX_INT_DIGITS + i64::try_from(digits.len())? {
        return Err(out_of_range().into());
    }
    let max_group = (point - 1).div_euclid(4);
    let min_group = (point - digits.len() as i64).div_euclid(4);
    let mut groups = vec![0_i16; (max_group - min_group + 1) as usize];
    for (k, digit) in digits.iter().enumerate() {
        let power = point - 1 - k as i64;
        let slot = (max_group - power.div_euclid(4)) as usize;
        groups[slot] += digit * 10_i16.pow(power.rem_euclid(4) as u32);
    }

    let mut weight = max_group;
    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i64;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (weight, sign) = if groups.is_empty() {
        (0, SIGN_POSITIVE)
    } else {
        (weight, if negative { SIGN_NEGATIVE } else { SIGN_POSITIVE })
    };

    let ndigits = i16::try_from(groups.len())?;
    let weight = i16::try_from(weight)?;
    out.put_i16(ndigits);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(scale as u16);
    for group in groups {
        out.put_i16(group);
    }
    Ok(())
}

/// Decode the binary format into decimal text
pub fn decode(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("numeric value is truncated".into());
    }
    let read_u16 = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = i64::from(read_u16(2) as i16);
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value is truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|i| read_u16(8 + i * 2) as i16).collect();
    let group_at = |index: i64| -> i16 {
        usize::try_from(index)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    match sign {
        SIGN_NAN => return Ok("NaN".to_string()),
        SIGN_POS_INFINITY => return Ok("Infinity".to_string()),
        SIGN_NEG_INFINITY => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let mut text = String::new();
    if sign == SIGN_NEGATIVE {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for index in 0..=weight {
            if index == 0 {
                let _ = write!(text, "{}", group_at(index));
            } else {
                let _ = write!(text, "{:04}", group_at(index));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", group_at(index));
            index += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

fn write_special(out: &mut BytesMut, sign: u16) -> Result<(), BoxError> {
    out.put_i16(0);
    out.put_i16(0);
    out.put_u16(sign);
    out.put_u16(0);
    Ok(())
}
