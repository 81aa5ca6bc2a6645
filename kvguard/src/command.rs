//! Commands sent to a backend and the replies decoded from it

use crate::error::{KvError, Result};

/// A single store command: a name plus binary-safe arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Vec<u8>>,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Append every argument of an iterator
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.args
    }
}

/// Conversion into a wire argument
pub trait IntoArg {
    fn into_arg(self) -> Vec<u8>;
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Vec<u8> {
        self
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl<const N: usize> IntoArg for &[u8; N] {
    fn into_arg(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IntoArg for &Vec<u8> {
    fn into_arg(self) -> Vec<u8> {
        self.clone()
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Vec<u8> {
        self.into_bytes()
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

macro_rules! int_arg {
    ($($ty:ty),*) => {
        $(
            impl IntoArg for $ty {
                fn into_arg(self) -> Vec<u8> {
                    self.to_string().into_bytes()
                }
            }
        )*
    };
}

int_arg!(i32, i64, u32, u64, usize, isize);

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(Vec<u8>),
    Status(String),
    Array(Vec<Reply>),
    /// An error reply nested in an array, e.g. one failed command of an EXEC
    Error(String),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Integer reply
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Reply::Int(value) => Ok(*value),
            Reply::Error(msg) => Err(KvError::Server(msg.clone())),
            other => Err(KvError::WrongAnswer(format!("expected integer, got {other:?}"))),
        }
    }

    /// Bulk or status payload; `None` for a nil reply
    pub fn into_bytes(self) -> Result<Option<Vec<u8>>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Status(status) => Ok(Some(status.into_bytes())),
            Reply::Error(msg) => Err(KvError::Server(msg)),
            other => Err(KvError::WrongAnswer(format!("expected bulk, got {other:?}"))),
        }
    }

    /// Like [`Reply::into_bytes`], decoded as UTF-8 (lossy)
    pub fn into_string(self) -> Result<Option<String>> {
        Ok(self
            .into_bytes()?
            .map(|data| String::from_utf8_lossy(&data).into_owned()))
    }

    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Error(msg) => Err(KvError::Server(msg)),
            other => Err(KvError::WrongAnswer(format!("expected array, got {other:?}"))),
        }
    }

    /// Array of bulk strings; non-bulk elements are skipped
    pub fn into_strings(self) -> Result<Vec<String>> {
        Ok(self
            .into_array()?
            .into_iter()
            .filter_map(|item| match item {
                Reply::Bulk(data) => Some(String::from_utf8_lossy(&data).into_owned()),
                _ => None,
            })
            .collect())
    }
}
