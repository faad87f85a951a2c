use serde::{Deserialize, Serialize};

/// The result code (`res`) carried by a response frame.
///
/// A response frame arriving at all only tells that the device parsed the request,
/// not that it applied it. The `res` field says whether the command was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ResponseCode {
    pub code: i64,
    pub message: &'static str,
}

impl ResponseCode {
    /// This is a code that means "Ok".
    ///
    /// Use this function instead of comparing the code to `0`.
    pub fn is_ok(&self) -> bool {
        self.code == OK.code
    }

    /// This is a code which means "Error".
    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }
}

/// The OK response code.
pub const OK: ResponseCode = ResponseCode {
    code: 0,
    message: "Ok",
};
/// The device rejected the command, e.g. an unknown command code.
pub const ERROR: ResponseCode = ResponseCode {
    code: 1,
    message: "Error",
};
/// The frame did not carry a `res` field at all.
pub const MISSING: ResponseCode = ResponseCode {
    code: -1,
    message: "Missing result code",
};

/// Trait for frames carrying a result code.
pub trait ResponseCodeTrait {
    /// Get the response code.
    /// # Returns
    /// The response code.
    fn response_code(&self) -> ResponseCode;

    fn map_response_code(code: Option<i64>) -> ResponseCode {
        match code {
            Some(0) => OK,
            Some(_) => ERROR,
            None => MISSING,
        }
    }
}
