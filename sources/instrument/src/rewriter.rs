use bytes::{BufMut, Bytes, BytesMut};
use parse::classfile::ClassInfo;

use crate::error::InstrumentResult;
use crate::internal;

/// Rebuilds a class file from its original bytes, entries to append to the
/// constant pool, and replacements for some of its method_info structures.
/// Everything else is copied through unchanged.
pub fn rewrite_class(
    class: &ClassInfo,
    replaced: &[Option<Bytes>],
    added_count: u16,
    added: &[u8],
) -> InstrumentResult<Vec<u8>> {
    if replaced.len() != class.methods.len() {
        return Err(internal!(
            "{} replacement slots for {} methods",
            replaced.len(),
            class.methods.len()
        ));
    }

    let pool_count = class
        .pool_count()
        .checked_add(added_count)
        .ok_or_else(|| internal!("constant pool count overflows"))?;

    let bytes = class.bytes();
    let layout = &class.layout;

    let growth: i64 = class
        .methods
        .iter()
        .zip(replaced)
        .filter_map(|(method, replacement)| {
            replacement
                .as_ref()
                .map(|r| r.len() as i64 - method.length as i64)
        })
        .sum();

    let mut out =
        BytesMut::with_capacity((bytes.len() as i64 + growth) as usize + added.len());

    out.put_slice(&bytes[..layout.pool_start]);
    out.put_u16(pool_count);
    out.put_slice(&bytes[layout.pool_start + 2..layout.intermediate_start]);
    out.put_slice(added);
    out.put_slice(&bytes[layout.intermediate_start..layout.methods_start + 2]);

    for (method, replacement) in class.methods.iter().zip(replaced) {
        match replacement {
            Some(info) => out.put_slice(info),
            None => out.put_slice(&bytes[method.offset..method.offset + method.length]),
        }
    }

    out.put_slice(&bytes[layout.attributes_start..]);

    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use bytes::Bytes;
    use parse::builder::{ClassBuilder, MethodBody};
    use parse::classfile::ClassInfo;
    use parse::flags::MethodAccessFlags;
    use parse::pool::ConstantEntry;

    use super::rewrite_class;

    fn sample() -> Result<ClassInfo> {
        let mut builder = ClassBuilder::new("demo/Rewrite", Some("java/lang/Object"));
        builder
            .method(
                MethodAccessFlags::STATIC,
                "a",
                "()V",
                Some(MethodBody::new(0, 0, vec![0xb1])),
            )
            .method(
                MethodAccessFlags::STATIC,
                "b",
                "()V",
                Some(MethodBody::new(0, 0, vec![0xb1])),
            )
            .source_file("Rewrite.java");

        ClassInfo::parse(&builder.build())
    }

    #[test]
    fn it_copies_untouched_classes_verbatim() -> Result<()> {
        let class = sample()?;
        let rewritten = rewrite_class(&class, &[None, None], 0, &[])?;

        assert_eq!(rewritten.as_slice(), &class.bytes()[..]);
        Ok(())
    }

    #[test]
    fn it_appends_pool_entries_and_swaps_methods() -> Result<()> {
        let class = sample()?;

        // utf8 "hi"
        let added = [1, 0, 2, b'h', b'i'];

        // method b with an extra nop in front of its return
        let original = class.method_info_bytes(1)?;
        let code = class.code_layout(1)?.code_offset;
        let mut method = original[..code].to_vec();
        method.extend_from_slice(&[0x00, 0xb1]);
        method.extend_from_slice(&original[code + 1..]);

        let attribute_length = u32::from_be_bytes(method[code - 12..code - 8].try_into()?);
        method[code - 12..code - 8].copy_from_slice(&(attribute_length + 1).to_be_bytes());
        method[code - 4..code].copy_from_slice(&2u32.to_be_bytes());

        let rewritten = rewrite_class(&class, &[None, Some(Bytes::from(method))], 1, &added)?;
        let reparsed = ClassInfo::parse(&rewritten)?;

        assert_eq!(reparsed.pool_count(), class.pool_count() + 1);
        assert_eq!(
            reparsed.constant_pool.get(class.pool_count()),
            Some(&ConstantEntry::Utf8("hi".to_string()))
        );
        assert_eq!(reparsed.code(0)?, &[0xb1]);
        assert_eq!(reparsed.code(1)?, &[0x00, 0xb1]);
        assert_eq!(reparsed.name()?, "demo/Rewrite");

        Ok(())
    }
}
