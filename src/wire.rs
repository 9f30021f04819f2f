use crate::Error;
use rsa::BigUint;

/// Appends a big-endian u32 to a buffer
pub fn append_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend(val.to_be_bytes());
}

/// Reads a big-endian u32 from the front of a slice and returns it together
/// with what remains of the slice
pub fn extract_u32(start: &[u8]) -> Result<(u32, &[u8]), Error> {
    if start.len() < 4 {
        return Err(Error::Protocol("truncated u32 field"));
    }
    let val = u32::from_be_bytes([start[0], start[1], start[2], start[3]]);
    Ok((val, &start[4..]))
}

/// Appends an ssh string field (u32 length followed by the raw bytes)
pub fn append_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    append_u32(buf, bytes.len() as u32);
    buf.extend(bytes);
}

/// Parses an ssh string field into its raw bytes.
/// What is left of the containing slice is returned along with the bytes.
pub fn extract_string(start: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    let (length, rest) = extract_u32(start)?;
    let length = length as usize;
    if rest.len() < length {
        return Err(Error::Protocol("truncated string field"));
    }
    Ok((rest[..length].to_vec(), &rest[length..]))
}

/// Appends an ssh name-list built from a list of algorithm names
pub fn append_name_list(buf: &mut Vec<u8>, list: &[&str]) {
    let joined = list.join(",");
    append_string(buf, joined.as_bytes());
}

/// Parses an ssh name-list field into a vector of its comma separated names.
/// An empty list is permitted and yields an empty vector.
pub fn extract_name_list(start: &[u8]) -> Result<(Vec<String>, &[u8]), Error> {
    let (bytes, rest) = extract_string(start)?;
    if bytes.is_empty() {
        return Ok((Vec::new(), rest));
    }
    let text = String::from_utf8_lossy(&bytes);
    Ok((text.split(',').map(|s| s.to_string()).collect(), rest))
}

/// Appends an ssh mpint. Values here are always non-negative: leading zero
/// bytes are stripped and a single zero byte is prefixed when the leading
/// bit would otherwise read as a sign bit.
pub fn append_mpint(buf: &mut Vec<u8>, num: &BigUint) {
    let bytes = num.to_bytes_be();
    let mut start = 0;
    while start < bytes.len() && bytes[start] == 0 {
        start += 1;
    }
    if start == bytes.len() {
        // Zero encodes as the empty string
        append_u32(buf, 0);
        return;
    }
    let needs_pad = bytes[start] & 0x80 != 0;
    append_u32(buf, (bytes.len() - start + usize::from(needs_pad)) as u32);
    if needs_pad {
        buf.push(0);
    }
    buf.extend(&bytes[start..]);
}

/// Parses an ssh mpint into a non-negative bignum, tolerating the optional
/// leading zero pad byte
pub fn extract_mpint(start: &[u8]) -> Result<(BigUint, &[u8]), Error> {
    let (bytes, rest) = extract_string(start)?;
    Ok((BigUint::from_bytes_be(&bytes), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let mut buf = Vec::new();
        append_u32(&mut buf, 0xDEAD_BEEF);
        let (val, rest) = extract_u32(&buf).unwrap();
        assert_eq!(val, 0xDEAD_BEEF);
        assert!(rest.is_empty());
    }

    #[test]
    fn u32_truncated() {
        assert!(extract_u32(&[0, 1, 2]).is_err());
    }

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        append_string(&mut buf, b"ssh-userauth");
        append_string(&mut buf, b"");
        let (first, rest) = extract_string(&buf).unwrap();
        assert_eq!(first, b"ssh-userauth");
        let (second, rest) = extract_string(rest).unwrap();
        assert!(second.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn string_truncated_body() {
        let mut buf = Vec::new();
        append_u32(&mut buf, 10);
        buf.extend(b"short");
        assert!(extract_string(&buf).is_err());
    }

    #[test]
    fn name_list_round_trip() {
        let mut buf = Vec::new();
        append_name_list(&mut buf, &["aes128-ctr", "aes128-cbc"]);
        let (list, rest) = extract_name_list(&buf).unwrap();
        assert_eq!(list, vec!["aes128-ctr".to_string(), "aes128-cbc".to_string()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn name_list_empty() {
        let mut buf = Vec::new();
        append_name_list(&mut buf, &[]);
        let (list, _) = extract_name_list(&buf).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn mpint_high_bit_gets_pad_byte() {
        let num = BigUint::from_bytes_be(&[0x80, 0x01]);
        let mut buf = Vec::new();
        append_mpint(&mut buf, &num);
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 0x80, 0x01]);
        let (parsed, rest) = extract_mpint(&buf).unwrap();
        assert_eq!(parsed, num);
        assert!(rest.is_empty());
    }

    #[test]
    fn mpint_zero_is_empty_string() {
        let mut buf = Vec::new();
        append_mpint(&mut buf, &BigUint::from_bytes_be(&[0, 0]));
        assert_eq!(buf, vec![0, 0, 0, 0]);
        let (parsed, _) = extract_mpint(&buf).unwrap();
        assert_eq!(parsed, BigUint::from_bytes_be(&[]));
    }

    #[test]
    fn mpint_strips_redundant_leading_zeros() {
        let num = BigUint::from_bytes_be(&[0, 0, 0x42]);
        let mut buf = Vec::new();
        append_mpint(&mut buf, &num);
        assert_eq!(buf, vec![0, 0, 0, 1, 0x42]);
    }
}
