//
// Error generator macro
//
use std::error::Error as StdError;

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $src_fn:expr, $usr_msg_fun:expr ),+ $(,)? ) => {
        const BAD_REQUEST: u16 = 400;

        pub enum ErrorKind { $($name( $ty )),+ }

        pub struct Error { message: String, error: ErrorKind, error_code: u16 }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self { Error::from((stringify!($name), err)) }
        })+
        $(impl From<(&str, $ty)> for Error {
            fn from(err: (&str, $ty)) -> Self {
                Error { message: err.0.into(), error: ErrorKind::$name(err.1), error_code: BAD_REQUEST }
            }
        })+
        impl Error {
            pub fn display_error(&self) -> String {
                match &self.error {$(
                   ErrorKind::$name(e) => {
                        let err_msg = $src_fn(e).map(|e| format!(": {e}")).unwrap_or_default();
                        format!("{}{err_msg}", &self.message)
                   },
                )+}
            }

            pub fn get_user_msg(&self) -> String {
                match &self.error {$(
                   ErrorKind::$name(e) => $usr_msg_fun(e, &self.message),
                )+}
            }
        }
    };
}

use diesel::r2d2::PoolError as R2d2Err;
use diesel::result::Error as DieselErr;
use diesel::ConnectionError as DieselConnErr;
use jsonwebtoken::errors::Error as JwtErr;
use openssl::error::ErrorStack as SslErr;
use regex::Error as RegexErr;
use reqwest::Error as ReqErr;
use rocket::error::Error as RocketErr;
use serde_json::{Error as SerdeErr, Value};
use serde_yaml::Error as YamlErr;
use std::io::Error as IoErr;
use std::time::SystemTimeError as TimeErr;
use url::ParseError as UrlParseErr;

// Error struct
// Contains a String error message, meant for the user and an enum variant, with an error of different types.
//
// After the variant itself, there are two expressions. The first one is a function to get the source
// error (if any) for logging purposes, the second one contains the function used to obtain the
// response body sent to the client.
make_error! {
    // Used to represent err! calls; the payload is the log-only message
    Simple(String):  _log_string, _api_error,

    // Used for special return values, like OAuth error responses
    Json(Value):     _no_source, _serialize,
    Db(DieselErr):   _has_source, _api_error,
    DbConn(DieselConnErr): _has_source, _api_error,
    R2d2(R2d2Err):   _has_source, _api_error,
    Serde(SerdeErr): _has_source, _api_error,
    Yaml(YamlErr):   _has_source, _api_error,
    Jwt(JwtErr):     _has_source, _api_error,
    Io(IoErr):       _has_source, _api_error,
    Time(TimeErr):   _has_source, _api_error,
    Req(ReqErr):     _has_source, _api_error,
    Regex(RegexErr): _has_source, _api_error,
    Url(UrlParseErr): _has_source, _api_error,
    Ssl(SslErr):     _has_source, _api_error,
    Rocket(RocketErr): _has_source, _api_error,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_error())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_error())
    }
}

impl StdError for Error {}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        let usr_msg = usr_msg.into();
        let log_msg = log_msg.into();
        let log_msg = if log_msg == usr_msg {
            String::new()
        } else {
            log_msg
        };
        Error {
            message: usr_msg,
            error: ErrorKind::Simple(log_msg),
            error_code: BAD_REQUEST,
        }
    }

    #[must_use]
    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    #[must_use]
    pub const fn with_code(mut self, code: u16) -> Self {
        self.error_code = code;
        self
    }

    pub const fn status_code(&self) -> u16 {
        self.error_code
    }
}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl<S, E: Into<Error>> MapResult<S> for Result<S, E> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.map_err(|e| e.into().with_msg(msg))
    }
}

impl<E: Into<Error>> MapResult<()> for Result<usize, E> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.and(Ok(())).map_res(msg)
    }
}

impl<S> MapResult<S> for Option<S> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.ok_or_else(|| Error::new(msg, ""))
    }
}

fn _has_source<T: StdError>(e: &T) -> Option<String> {
    Some(format!("{e}"))
}
fn _no_source<T>(_: &T) -> Option<String> {
    None
}
fn _log_string(e: &String) -> Option<String> {
    if e.is_empty() {
        None
    } else {
        Some(e.clone())
    }
}

fn _serialize(e: &impl serde::Serialize, _msg: &str) -> String {
    serde_json::to_string(e).unwrap_or_else(|_| String::from("{}"))
}

// The stable boundary shape for domain errors.
fn _api_error(_: &impl std::any::Any, msg: &str) -> String {
    serde_json::to_string(&serde_json::json!({"detail": msg})).unwrap()
}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        match self.error {
            ErrorKind::Simple(_) | ErrorKind::Json(_) => {} // Already logged where it happened
            _ => log::error!(target: "error", "{:#?}", self),
        };

        let code = Status::from_code(self.error_code).unwrap_or(Status::BadRequest);
        let body = self.get_user_msg();
        Response::build()
            .status(code)
            .header(ContentType::JSON)
            .sized_body(Some(body.len()), Cursor::new(body))
            .ok()
    }
}

//
// Error return macros
//
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        error!("{}: {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_silent {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_code {
    ($msg:expr, $err_code:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg).with_code($err_code));
    }};
    ($usr_msg:expr, $log_value:expr, $err_code:expr) => {{
        error!("{}: {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value).with_code($err_code));
    }};
}

/// RFC 6749 error body for the OAuth endpoints; always a 400.
#[macro_export]
macro_rules! err_oauth {
    ($error:expr) => {{
        return Err($crate::error::Error::from(serde_json::json!({"error": $error})));
    }};
    ($error:expr, $description:expr) => {{
        return Err($crate::error::Error::from(serde_json::json!({
            "error": $error,
            "error_description": $description,
        })));
    }};
}

#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        log::error!(target: "auth", "Unauthorized Error: {}", $expr);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $expr));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        log::error!(target: "auth", "Unauthorized Error: {}. {}", $usr_msg, $log_value);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $usr_msg));
    }};
}
