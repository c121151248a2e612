use core::fmt;

use crate::ascii::two_digits;

/// Gemini status code.
///
/// The value is always within `10..=99`; the first digit is the [`StatusClass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u8);

#[allow(missing_docs)]
impl Status {
    pub const INPUT: Status = Status(10);
    pub const INPUT_SENSITIVE: Status = Status(11);

    pub const SUCCESS: Status = Status(20);

    pub const REDIRECT_TEMPORARY: Status = Status(30);
    pub const REDIRECT_PERMANENT: Status = Status(31);

    pub const TEMPORARY_FAILURE: Status = Status(40);
    pub const SERVER_UNAVAILABLE: Status = Status(41);
    pub const CGI_ERROR: Status = Status(42);
    pub const PROXY_ERROR: Status = Status(43);
    pub const SLOW_DOWN: Status = Status(44);

    pub const PERMANENT_FAILURE: Status = Status(50);
    pub const NOT_FOUND: Status = Status(51);
    pub const GONE: Status = Status(52);
    pub const PROXY_REQUEST_REFUSED: Status = Status(53);
    pub const BAD_REQUEST: Status = Status(59);

    pub const CLIENT_CERTIFICATE_REQUIRED: Status = Status(60);
    pub const CERTIFICATE_NOT_AUTHORIZED: Status = Status(61);
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);
}

impl Status {
    /// Returns the status for `code`, or `None` when it is outside `10..=99`.
    pub const fn new(code: u8) -> Option<Self> {
        if code >= 10 && code <= 99 {
            Some(Self(code))
        } else {
            None
        }
    }

    /// The numeric code.
    pub const fn code(self) -> u8 {
        self.0
    }

    /// The class encoded by the first digit.
    pub const fn class(self) -> StatusClass {
        match self.0 / 10 {
            1 => StatusClass::Input,
            2 => StatusClass::Success,
            3 => StatusClass::Redirect,
            4 => StatusClass::TemporaryFailure,
            5 => StatusClass::PermanentFailure,
            6 => StatusClass::ClientCertificateRequired,
            _ => StatusClass::Undefined,
        }
    }

    pub(crate) fn to_ascii(self) -> [u8; 2] {
        two_digits(self.0)
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        value.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Status class, given by the first digit of the code.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    /// 1x: the server wants input from the user
    Input,
    /// 2x: the body follows the header
    Success,
    /// 3x: meta holds the new location
    Redirect,
    /// 4x: try again later
    TemporaryFailure,
    /// 5x: do not retry
    PermanentFailure,
    /// 6x: a client certificate is needed
    ClientCertificateRequired,
    /// 7x to 9x: valid on the wire, no meaning assigned
    Undefined,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_range() {
        assert_eq!(Status::new(9), None);
        assert_eq!(Status::new(100), None);
        assert_eq!(Status::new(0), None);
        assert_eq!(Status::new(10), Some(Status::INPUT));
        assert_eq!(Status::new(99).map(Status::code), Some(99));
    }

    #[test]
    fn test_status_class() {
        assert_eq!(Status::INPUT_SENSITIVE.class(), StatusClass::Input);
        assert_eq!(Status::SUCCESS.class(), StatusClass::Success);
        assert_eq!(Status::REDIRECT_PERMANENT.class(), StatusClass::Redirect);
        assert_eq!(Status::SLOW_DOWN.class(), StatusClass::TemporaryFailure);
        assert_eq!(Status::BAD_REQUEST.class(), StatusClass::PermanentFailure);
        assert_eq!(
            Status::CERTIFICATE_NOT_VALID.class(),
            StatusClass::ClientCertificateRequired
        );
        assert_eq!(Status::new(75).map(Status::class), Some(StatusClass::Undefined));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::NOT_FOUND.to_string(), "51");
        assert_eq!(&Status::SUCCESS.to_ascii(), b"20");
    }
}
