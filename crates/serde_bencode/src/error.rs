#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub position: Option<usize>,
}

impl Error {
    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(pos) => write!(f, "bencode error at byte {}: {}", pos, self.kind),
            None => write!(f, "bencode error: {}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        ErrorKind::Custom(msg.to_string()).into()
    }
}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        ErrorKind::Custom(msg.to_string()).into()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind, position: None }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(e).into()
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    Custom(String),
    Io(std::io::Error),
    UnexpectedEof(&'static str),
    BadInputData(&'static str),
    Unsupported(&'static str),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Custom(msg) => write!(f, "{}", msg),
            ErrorKind::Io(e) => write!(f, "i/o failure: {}", e),
            ErrorKind::UnexpectedEof(expected) => write!(f, "input ended while reading {}", expected),
            ErrorKind::BadInputData(msg) => write!(f, "malformed input: {}", msg),
            ErrorKind::Unsupported(what) => write!(f, "bencode has no representation for {}", what),
        }
    }
}
