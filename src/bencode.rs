use std::fmt;

// Bencode codec shared by the UDP (KRPC) and TCP (extension message) paths.
//
// The decoder is strict about framing; the encoder produces canonical output
// (dict keys in ascending byte order), so encode(decode(b)) == b whenever b
// was canonical to begin with.

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("malformed bencode at offset {0}")]
    Malformed(usize),
    #[error("truncated bencode")]
    Truncated,
    #[error("bencode type mismatch")]
    TypeMismatch,
    #[error("dict keys not encodable in canonical order")]
    KeyOrder,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    // Insertion order is preserved; `encode` canonicalizes.
    Dict(Vec<(Vec<u8>, Value)>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "0x{}", hex::encode(b)),
            },
            Value::Int(i) => write!(f, "{i}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(pairs) => {
                let mut m = f.debug_map();
                for (k, v) in pairs {
                    match std::str::from_utf8(k) {
                        Ok(s) => m.key(&s),
                        Err(_) => m.key(&hex::encode(k)),
                    };
                    m.value(v);
                }
                m.finish()
            }
        }
    }
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dict lookup by raw key. Returns `None` on non-dicts too, which keeps
    /// call sites that probe optional message fields short.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_int()
    }
}

/// Decode a complete value. Trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(input)?;
    if used != input.len() {
        return Err(BencodeError::Malformed(used));
    }
    Ok(value)
}

/// Decode one value off the front of `input`, returning the number of bytes
/// consumed. Callers that frame their own payloads (the ut_metadata piece
/// header, whose binary payload follows the dict) use this directly.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut p = Parser { input, pos: 0 };
    let value = p.value(0)?;
    Ok((value, p.pos))
}

/// Canonical encoding. Dict entries are sorted by key; a dict with duplicate
/// keys has no canonical form and yields `KeyOrder`.
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut out = Vec::with_capacity(64);
    encode_into(value, &mut out)?;
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) -> Result<(), BencodeError> {
    match value {
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out)?;
            }
            out.push(b'e');
        }
        Value::Dict(pairs) => {
            let mut order: Vec<usize> = (0..pairs.len()).collect();
            order.sort_by(|&a, &b| pairs[a].0.cmp(&pairs[b].0));
            for w in order.windows(2) {
                if pairs[w[0]].0 == pairs[w[1]].0 {
                    return Err(BencodeError::KeyOrder);
                }
            }
            out.push(b'd');
            for idx in order {
                let (k, v) = &pairs[idx];
                out.extend_from_slice(k.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(k);
                encode_into(v, out)?;
            }
            out.push(b'e');
        }
    }
    Ok(())
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::Malformed(self.pos));
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?.to_vec())),
            _ => Err(BencodeError::Malformed(self.pos)),
        }
    }

    fn int(&mut self) -> Result<Value, BencodeError> {
        self.bump(); // 'i'
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.bump();
        }
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.bump();
        }
        if self.peek()? != b'e' {
            return Err(BencodeError::Malformed(self.pos));
        }
        let digits = &self.input[digits_start..self.pos];
        if digits.is_empty() {
            return Err(BencodeError::Malformed(self.pos));
        }
        // Canonical integers: no leading zeros, no "-0".
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::Malformed(digits_start));
        }
        if negative && digits == b"0" {
            return Err(BencodeError::Malformed(start));
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| BencodeError::Malformed(start))?;
        let n: i64 = text.parse().map_err(|_| BencodeError::Malformed(start))?;
        self.bump(); // 'e'
        Ok(Value::Int(n))
    }

    fn byte_string(&mut self) -> Result<&'a [u8], BencodeError> {
        let len_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.bump();
        }
        let digits = &self.input[len_start..self.pos];
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::Malformed(len_start));
        }
        if self.peek()? != b':' {
            return Err(BencodeError::Malformed(self.pos));
        }
        self.bump();
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::Malformed(len_start))?;
        let start = self.pos;
        let end = start.checked_add(len).ok_or(BencodeError::Malformed(len_start))?;
        if end > self.input.len() {
            return Err(BencodeError::Truncated);
        }
        self.pos = end;
        Ok(&self.input[start..end])
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump(); // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump(); // 'd'
        let mut pairs = Vec::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.bump();
                    return Ok(Value::Dict(pairs));
                }
                b'0'..=b'9' => {}
                _ => return Err(BencodeError::Malformed(self.pos)),
            }
            let key = self.byte_string()?.to_vec();
            // A dict that ends right after a key lost its value.
            if self.peek()? == b'e' {
                return Err(BencodeError::Truncated);
            }
            let value = self.value(depth + 1)?;
            pairs.push((key, value));
        }
    }
}
