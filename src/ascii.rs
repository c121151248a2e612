pub(crate) const CR: u8 = 13;
pub(crate) const LF: u8 = 10;
pub(crate) const SP: u8 = 32;
pub(crate) const ZERO: u8 = 48;

pub(crate) const CRLF: &[u8] = &[CR, LF];

pub(crate) fn atoi(data: &[u8]) -> Option<u32> {
    if data.is_empty() {
        return None;
    }

    let mut val: u32 = 0;

    for digit in data {
        if !digit.is_ascii_digit() {
            return None;
        }

        val = val.checked_mul(10)?.checked_add((digit - ZERO).into())?;
    }

    Some(val)
}

/// Position of the first `\r\n` in `data`.
pub(crate) fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == CRLF)
}

/// Two ascii digits for values below 100.
pub(crate) fn two_digits(n: u8) -> [u8; 2] {
    [ZERO + (n / 10) % 10, ZERO + n % 10]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atoi() {
        assert!(atoi("0".as_bytes()) == Some(0));
        assert!(atoi("5".as_bytes()) == Some(5));
        assert!(atoi("123".as_bytes()) == Some(123));
        assert!(atoi("123456789".as_bytes()) == Some(123456789));
        assert!(atoi("0123456789".as_bytes()) == Some(123456789));
        assert!(atoi("abc".as_bytes()) == None);
        assert!(atoi("123a456".as_bytes()) == None);
        assert!(atoi("1:".as_bytes()) == None);
        assert!(atoi("".as_bytes()) == None);
        assert!(atoi("99999999999".as_bytes()) == None);
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"20 text/gemini\r\nbody"), Some(14));
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"no terminator\n"), None);
        assert_eq!(find_crlf(b"\r\r\n"), Some(1));
        assert_eq!(find_crlf(b""), None);
    }

    #[test]
    fn test_two_digits() {
        assert_eq!(&two_digits(10), b"10");
        assert_eq!(&two_digits(20), b"20");
        assert_eq!(&two_digits(99), b"99");
        assert_eq!(&two_digits(7), b"07");
    }
}
