//! Parsing and writing of CIL method bodies.
//!
//! A body is a tiny (1 byte) or fat (12 byte) header, the instruction bytes, and for fat
//! headers an optional chain of 4-byte aligned data sections carrying exception clauses.
//!
//! ```rust
//! use dotpatch::metadata::method::MethodBody;
//!
//! // tiny header, code size 1, `ret`
//! let data = [0x06, 0x2A];
//! let body = MethodBody::parse(&data)?;
//! assert!(!body.is_fat);
//! assert_eq!(body.code(&data)?, &[0x2A]);
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use crate::{
    file::io::{read_le, read_le_at, write_le},
    metadata::{
        method::{
            ExceptionHandler, ExceptionHandlerFlags, MethodBodyFlags, SectionFlags,
            TINY_CODE_LIMIT, TINY_MAX_STACK,
        },
        token::Token,
    },
    Error::{self, OutOfBounds},
    Result,
};

/// The parsed header and exception sections of one method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Size of the method (length of all instructions, not counting the header) in bytes
    pub size_code: usize,
    /// Size of the method header in bytes
    pub size_header: usize,
    /// Token of the stand-alone signature describing the locals. Null means no locals
    pub local_var_sig_token: Token,
    /// Maximum number of items on the operand stack
    pub max_stack: usize,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
    /// Flag, indicating that locals are zero-initialised
    pub is_init_local: bool,
    /// A list of exception handlers this method has
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Parse a method body from `data`, which starts at the header.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] for truncated data, [`Error::Malformed`] for an
    /// unknown header kind and [`Error::NotSupported`] for filter clauses.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    local_var_sig_token: Token(0),
                    max_stack: TINY_MAX_STACK,
                    is_fat: false,
                    is_init_local: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;
                let size_header = ((first_duo >> 12) * 4) as usize;
                if size_header < 12 {
                    return Err(malformed_error!("Fat header size {} is too small", size_header));
                }

                let max_stack = read_le::<u16>(&data[2..])? as usize;
                let size_code = read_le::<u32>(&data[4..])? as usize;
                if data.len() < size_code + size_header {
                    return Err(OutOfBounds);
                }

                let local_var_sig_token = Token(read_le::<u32>(&data[8..])?);
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000_1111_1111_1111_u16);

                let exception_handlers = if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    Self::parse_sections(data, (size_header + size_code + 3) & !3, size_code)?
                } else {
                    Vec::new()
                };

                Ok(MethodBody {
                    size_code,
                    size_header,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local: flags_header.contains(MethodBodyFlags::INIT_LOCALS),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    // Exception Handling -> II.25.4.6
    fn parse_sections(
        data: &[u8],
        mut cursor: usize,
        size_code: usize,
    ) -> Result<Vec<ExceptionHandler>> {
        let mut handlers = Vec::new();

        loop {
            let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(
                data.get(cursor..).ok_or(OutOfBounds)?,
            )?);
            if !section_flags.contains(SectionFlags::EHTABLE) {
                return Err(malformed_error!(
                    "Unknown method data section - 0x{:02x}",
                    section_flags.bits()
                ));
            }

            let section_start = cursor;
            if section_flags.contains(SectionFlags::FAT_FORMAT) {
                let size = (read_le::<u32>(&data[cursor..])? >> 8) as usize;
                if size < 4 || data.len() < cursor + size {
                    return Err(OutOfBounds);
                }

                cursor += 4;
                for _ in 0..(size - 4) / 24 {
                    #[allow(clippy::cast_possible_truncation)]
                    let flags = read_le_at::<u32>(data, &mut cursor)? as u16;
                    handlers.push(ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(flags),
                        try_offset: read_le_at::<u32>(data, &mut cursor)?,
                        try_length: read_le_at::<u32>(data, &mut cursor)?,
                        handler_offset: read_le_at::<u32>(data, &mut cursor)?,
                        handler_length: read_le_at::<u32>(data, &mut cursor)?,
                        class_token: Token(read_le_at::<u32>(data, &mut cursor)?),
                    });
                }
                cursor = section_start + size;
            } else {
                let size = read_le::<u8>(&data[cursor + 1..])? as usize;
                if size < 4 || data.len() < cursor + size {
                    return Err(OutOfBounds);
                }

                cursor += 4;
                for _ in 0..(size - 4) / 12 {
                    handlers.push(ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(
                            data,
                            &mut cursor,
                        )?),
                        try_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        try_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                        handler_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        handler_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                        class_token: Token(read_le_at::<u32>(data, &mut cursor)?),
                    });
                }
                cursor = section_start + size;
            }

            if !section_flags.contains(SectionFlags::MORE_SECTS) {
                break;
            }
            cursor = (cursor + 3) & !3;
        }

        for handler in &handlers {
            let try_end = handler.try_offset.checked_add(handler.try_length);
            let handler_end = handler.handler_offset.checked_add(handler.handler_length);
            match (try_end, handler_end) {
                (Some(try_end), Some(handler_end))
                    if try_end as usize <= size_code && handler_end as usize <= size_code => {}
                _ => {
                    return Err(malformed_error!(
                        "Exception clause 0x{:x}+0x{:x} / 0x{:x}+0x{:x} exceeds {} code bytes",
                        handler.try_offset,
                        handler.try_length,
                        handler.handler_offset,
                        handler.handler_length,
                        size_code
                    ));
                }
            }
        }

        if handlers
            .iter()
            .any(|handler| handler.flags.contains(ExceptionHandlerFlags::FILTER))
        {
            return Err(Error::NotSupported(
                "filter exception clauses".to_string(),
            ));
        }

        Ok(handlers)
    }

    /// Get the full size of header plus code
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_code + self.size_header
    }

    /// Returns the instruction bytes of the body that was parsed from `data`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if `data` is shorter than the body.
    pub fn code<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.size_header..self.size())
            .ok_or(OutOfBounds)
    }

    /// Serialises a header, `code` and the exception clauses into a complete body.
    ///
    /// A tiny header is used when the code is short, the stack shallow and there are
    /// neither locals nor clauses. Small clause sections are preferred when every clause fits.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the code or clause table exceeds the format limits.
    pub fn write(
        code: &[u8],
        max_stack: usize,
        local_var_sig_token: Token,
        init_locals: bool,
        handlers: &[ExceptionHandler],
    ) -> Result<Vec<u8>> {
        let Ok(size_code) = u32::try_from(code.len()) else {
            return Err(malformed_error!("Code of {} bytes is too large", code.len()));
        };
        let Ok(max_stack) = u16::try_from(max_stack) else {
            return Err(malformed_error!("Max stack {} is too large", max_stack));
        };

        let mut body = Vec::with_capacity(code.len() + 12);
        if code.len() <= TINY_CODE_LIMIT
            && usize::from(max_stack) <= TINY_MAX_STACK
            && local_var_sig_token.is_null()
            && handlers.is_empty()
        {
            #[allow(clippy::cast_possible_truncation)]
            body.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
            body.extend_from_slice(code);
            return Ok(body);
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if !handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }
        if init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }

        write_le(&mut body, flags.bits() | (3 << 12));
        write_le(&mut body, max_stack);
        write_le(&mut body, size_code);
        write_le(&mut body, local_var_sig_token.value());
        body.extend_from_slice(code);

        if handlers.is_empty() {
            return Ok(body);
        }

        while body.len() % 4 != 0 {
            body.push(0);
        }

        let small_size = 4 + handlers.len() * 12;
        if small_size <= 0xFF && handlers.iter().all(ExceptionHandler::fits_small) {
            body.push(SectionFlags::EHTABLE.bits());
            #[allow(clippy::cast_possible_truncation)]
            body.push(small_size as u8);
            write_le(&mut body, 0u16);
            for handler in handlers {
                #[allow(clippy::cast_possible_truncation)]
                {
                    write_le(&mut body, handler.flags.bits());
                    write_le(&mut body, handler.try_offset as u16);
                    body.push(handler.try_length as u8);
                    write_le(&mut body, handler.handler_offset as u16);
                    body.push(handler.handler_length as u8);
                }
                write_le(&mut body, handler.class_token.value());
            }
        } else {
            let fat_size = 4 + handlers.len() * 24;
            let Ok(fat_size) = u32::try_from(fat_size) else {
                return Err(malformed_error!("Too many exception clauses - {}", handlers.len()));
            };
            if fat_size > 0x00FF_FFFF {
                return Err(malformed_error!("Too many exception clauses - {}", handlers.len()));
            }

            write_le(
                &mut body,
                u32::from((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits())
                    | (fat_size << 8),
            );
            for handler in handlers {
                write_le(&mut body, u32::from(handler.flags.bits()));
                write_le(&mut body, handler.try_offset);
                write_le(&mut body, handler.try_length);
                write_le(&mut body, handler.handler_offset);
                write_le(&mut body, handler.handler_length);
                write_le(&mut body, handler.class_token.value());
            }
        }

        Ok(body)
    }
}
