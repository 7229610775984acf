use crate::{
    assembly::TokenSink,
    file::io::write_compressed_uint,
    metadata::{
        signatures::{TypeSignature, ELEMENT_TYPE, LOCAL_SIG},
        token::Token,
    },
    Result,
};

fn encode_type_def_or_ref_coded_index(token: Token) -> Result<u32> {
    match token.table() {
        Token::TYPE_DEF => Ok(token.row() << 2),
        table => Err(malformed_error!(
            "Invalid token table 0x{:02X} for TypeDefOrRef coded index - {}",
            table,
            token
        )),
    }
}

fn encode_type(ty: &TypeSignature, sink: &mut dyn TokenSink, buffer: &mut Vec<u8>) -> Result<()> {
    match ty {
        TypeSignature::Void => buffer.push(ELEMENT_TYPE::VOID),
        TypeSignature::Boolean => buffer.push(ELEMENT_TYPE::BOOLEAN),
        TypeSignature::I4 => buffer.push(ELEMENT_TYPE::I4),
        TypeSignature::I8 => buffer.push(ELEMENT_TYPE::I8),
        TypeSignature::R8 => buffer.push(ELEMENT_TYPE::R8),
        TypeSignature::String => buffer.push(ELEMENT_TYPE::STRING),
        TypeSignature::Object => buffer.push(ELEMENT_TYPE::OBJECT),
        TypeSignature::Class(class) => {
            buffer.push(ELEMENT_TYPE::CLASS);
            let token = sink.type_token(class)?;
            write_compressed_uint(buffer, encode_type_def_or_ref_coded_index(token)?)?;
        }
        TypeSignature::ByRef(inner) => {
            buffer.push(ELEMENT_TYPE::BYREF);
            encode_type(inner, sink, buffer)?;
        }
    }

    Ok(())
}

/// Encodes a local variable signature, registering class references with `sink`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `sink` hands out a token outside the `TypeDef` table.
pub fn encode_local_var_signature(
    locals: &[TypeSignature],
    sink: &mut dyn TokenSink,
) -> Result<Vec<u8>> {
    let mut buffer = vec![LOCAL_SIG];
    let Ok(count) = u32::try_from(locals.len()) else {
        return Err(malformed_error!("Too many locals - {}", locals.len()));
    };
    write_compressed_uint(&mut buffer, count)?;

    for local in locals {
        encode_type(local, sink, &mut buffer)?;
    }

    Ok(buffer)
}
