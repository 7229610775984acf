use crate::{
    file::parser::Parser,
    metadata::{
        resolver::TokenResolver,
        signatures::{TypeSignature, ELEMENT_TYPE, LOCAL_SIG},
        token::Token,
    },
    Error, Result,
};

const MAX_RECURSION_DEPTH: usize = 16;

/// Reads type signatures from a blob, resolving class references through a resolver.
pub struct SignatureParser<'a> {
    parser: Parser<'a>,
    resolver: &'a dyn TokenResolver,
    depth: usize,
}

impl<'a> SignatureParser<'a> {
    /// Create a new `SignatureParser` over `data`.
    #[must_use]
    pub fn new(data: &'a [u8], resolver: &'a dyn TokenResolver) -> Self {
        SignatureParser {
            parser: Parser::new(data),
            resolver,
            depth: 0,
        }
    }

    /// Parse a single type from the signature blob
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for unknown element types or too deep nesting,
    /// [`Error::Resolution`] for class references the resolver does not know.
    pub fn parse_type(&mut self) -> Result<TypeSignature> {
        self.depth += 1;
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(malformed_error!(
                "Signature nesting exceeds {}",
                MAX_RECURSION_DEPTH
            ));
        }

        let current_byte = self.parser.read_le::<u8>()?;
        let parsed = match current_byte {
            ELEMENT_TYPE::VOID => TypeSignature::Void,
            ELEMENT_TYPE::BOOLEAN => TypeSignature::Boolean,
            ELEMENT_TYPE::I4 => TypeSignature::I4,
            ELEMENT_TYPE::I8 => TypeSignature::I8,
            ELEMENT_TYPE::R8 => TypeSignature::R8,
            ELEMENT_TYPE::STRING => TypeSignature::String,
            ELEMENT_TYPE::OBJECT => TypeSignature::Object,
            ELEMENT_TYPE::BYREF => TypeSignature::ByRef(Box::new(self.parse_type()?)),
            ELEMENT_TYPE::CLASS => {
                let token = self.read_type_def_or_ref()?;
                let ty = self
                    .resolver
                    .resolve_type(token)
                    .ok_or(Error::Resolution { token })?;
                TypeSignature::Class(ty)
            }
            other => {
                return Err(malformed_error!(
                    "Unsupported element type in signature - 0x{:02x}",
                    other
                ))
            }
        };

        self.depth -= 1;
        Ok(parsed)
    }

    fn read_type_def_or_ref(&mut self) -> Result<Token> {
        let coded = self.parser.read_compressed_uint()?;
        match coded & 0x3 {
            0 => Ok(Token::from_parts(Token::TYPE_DEF, coded >> 2)),
            tag => Err(Error::NotSupported(format!(
                "TypeDefOrRef tag {tag} in local signature"
            ))),
        }
    }

    /// Parse a complete local variable signature.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the blob does not start with the local signature marker.
    pub fn parse_local_var_signature(&mut self) -> Result<Vec<TypeSignature>> {
        let head = self.parser.read_le::<u8>()?;
        if head != LOCAL_SIG {
            return Err(malformed_error!(
                "Local variable signature starts with 0x{:02x}",
                head
            ));
        }

        let count = self.parser.read_compressed_uint()?;
        if count as usize > self.parser.remaining() {
            return Err(malformed_error!(
                "Local variable signature declares {} locals in {} bytes",
                count,
                self.parser.remaining()
            ));
        }

        let mut locals = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locals.push(self.parse_type()?);
        }

        Ok(locals)
    }
}

/// Parses a local variable signature blob.
///
/// # Errors
/// See [`SignatureParser::parse_local_var_signature`].
pub fn parse_local_var_signature(
    data: &[u8],
    resolver: &dyn TokenResolver,
) -> Result<Vec<TypeSignature>> {
    SignatureParser::new(data, resolver).parse_local_var_signature()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::resolver::NullResolver;

    #[test]
    fn primitives_and_byref() {
        let data = [0x07, 0x03, 0x08, 0x10, 0x0a, 0x1c];
        let locals = parse_local_var_signature(&data, &NullResolver).unwrap();
        assert_eq!(
            locals,
            vec![
                TypeSignature::I4,
                TypeSignature::by_ref(TypeSignature::I8),
                TypeSignature::Object
            ]
        );
    }

    #[test]
    fn unresolved_class() {
        let data = [0x07, 0x01, 0x12, 0x04];
        assert!(matches!(
            parse_local_var_signature(&data, &NullResolver),
            Err(Error::Resolution { token }) if token == Token(0x02000001)
        ));
    }

    #[test]
    fn bad_header_and_truncation() {
        assert!(parse_local_var_signature(&[0x06, 0x00], &NullResolver).is_err());
        assert!(parse_local_var_signature(&[0x07, 0x02, 0x08], &NullResolver).is_err());
    }
}
