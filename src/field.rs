use crate::wire;
use rsa::BigUint;

/// A typed field of an outgoing ssh packet payload.
///
/// `Group` serializes its children behind a single length prefix: a
/// placeholder u32 is emitted first and back-patched with the inner byte
/// count once every child has been appended.
pub enum Field {
    U8(u8),
    U32(u32),
    Bytes(Vec<u8>),
    LenString(Vec<u8>),
    Bignum(BigUint),
    Group(Vec<Field>),
}

impl Field {
    /// Serializes this field onto the end of a buffer
    pub fn append(&self, dest: &mut Vec<u8>) {
        match self {
            Field::U8(val) => dest.push(*val),
            Field::U32(val) => wire::append_u32(dest, *val),
            Field::Bytes(bytes) => dest.extend(bytes),
            Field::LenString(bytes) => wire::append_string(dest, bytes),
            Field::Bignum(num) => wire::append_mpint(dest, num),
            Field::Group(children) => {
                let mark = dest.len();
                wire::append_u32(dest, 0);
                for child in children {
                    child.append(dest);
                }
                let inner = (dest.len() - mark - 4) as u32;
                dest[mark..mark + 4].copy_from_slice(&inner.to_be_bytes());
            }
        }
    }
}

/// Builds a packet payload from a message type byte and its fields
pub fn build_payload(msg_type: u8, fields: &[Field]) -> Vec<u8> {
    let mut payload = vec![msg_type];
    for field in fields {
        field.append(&mut payload);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_fields_serialize_in_order() {
        let payload = build_payload(
            50,
            &[
                Field::U8(3),
                Field::U32(0x0102_0304),
                Field::Bytes(vec![9, 9]),
                Field::LenString(b"ssh-rsa".to_vec()),
            ],
        );
        assert_eq!(payload[0], 50);
        assert_eq!(&payload[1..2], &[3]);
        assert_eq!(&payload[2..6], &[1, 2, 3, 4]);
        assert_eq!(&payload[6..8], &[9, 9]);
        assert_eq!(&payload[8..12], &[0, 0, 0, 7]);
        assert_eq!(&payload[12..], b"ssh-rsa");
    }

    #[test]
    fn bignum_field_is_mpint_encoded() {
        let mut buf = Vec::new();
        Field::Bignum(BigUint::from_bytes_be(&[0xFF])).append(&mut buf);
        assert_eq!(buf, vec![0, 0, 0, 2, 0, 0xFF]);
    }

    #[test]
    fn group_backpatches_inner_length() {
        let mut buf = Vec::new();
        Field::Group(vec![
            Field::LenString(b"ssh-rsa".to_vec()),
            Field::U8(1),
        ])
        .append(&mut buf);
        // 4-byte prefix, then 4 + 7 + 1 inner bytes
        assert_eq!(&buf[..4], &[0, 0, 0, 12]);
        assert_eq!(buf.len(), 16);
        let (blob, rest) = wire::extract_string(&buf).unwrap();
        assert_eq!(blob.len(), 12);
        assert!(rest.is_empty());
    }

    #[test]
    fn nested_groups_each_get_their_own_length() {
        let mut buf = Vec::new();
        Field::Group(vec![
            Field::U8(7),
            Field::Group(vec![Field::U32(1)]),
        ])
        .append(&mut buf);
        // outer: 1 + (4 + 4) inner bytes
        assert_eq!(&buf[..4], &[0, 0, 0, 9]);
        // inner group sits after the outer prefix and the u8
        assert_eq!(&buf[5..9], &[0, 0, 0, 4]);
        assert_eq!(&buf[9..], &[0, 0, 0, 1]);
    }
}
