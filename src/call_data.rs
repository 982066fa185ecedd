use std::fmt::{Display, Formatter};

use crate::error::Error;

pub const SEPARATOR: u8 = b'@';

/// Function name plus arguments, carried as `function@hex@hex...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallData {
    pub function: String,
    pub arguments: Vec<Vec<u8>>,
}

impl CallData {
    pub fn new(function: impl Into<String>, arguments: Vec<Vec<u8>>) -> Self {
        Self { function: function.into(), arguments }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(payload).map_err(|_| Error::InvalidCallData("payload is not valid UTF-8"))?;
        let mut parts = text.split(SEPARATOR as char);
        let function = parts.next().unwrap_or_default();
        if function.is_empty() {
            return Err(Error::InvalidCallData("missing function name"));
        }
        let arguments = parts
            .map(|arg| hex::decode(arg).map_err(|_| Error::InvalidCallData("argument is not valid hex")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { function: function.to_string(), arguments })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Display for CallData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.function)?;
        for arg in &self.arguments {
            write!(f, "@{}", hex::encode(arg))?;
        }
        Ok(())
    }
}
