pub mod bytes_ext;
pub mod descriptor;

#[cfg(test)]
mod tests {
    use crate::bytes_ext::{ByteSlice, SafeBuf};
    use crate::descriptor::{BaseType, FieldType, MethodType};
    use anyhow::Result;
    use bytes::Bytes;

    #[test]
    fn it_parses_simple_descriptors() -> Result<()> {
        let descriptor = FieldType::parse("Z")?;
        let descriptor = descriptor.into_base().unwrap();

        assert!(descriptor.is_boolean());

        Ok(())
    }

    #[test]
    fn it_parses_array_descriptors() -> Result<()> {
        let descriptor = FieldType::parse("[D")?;
        let component = descriptor.into_array().unwrap();

        assert!(component.into_base().unwrap().is_double());

        Ok(())
    }

    #[test]
    fn it_rejects_trailing_garbage() {
        assert!(FieldType::parse("II").is_err());
        assert!(MethodType::parse("(I").is_err());
    }

    #[test]
    fn it_parses_method_descriptors() -> Result<()> {
        let descriptor = MethodType::parse("(IDLjava/lang/Thread;)Ljava/lang/Object;")?;
        assert_eq!(
            descriptor.parameters,
            vec![
                FieldType::Base(BaseType::Int),
                FieldType::Base(BaseType::Double),
                FieldType::Object("java/lang/Thread".to_string())
            ]
        );
        assert_eq!(descriptor.argument_slots(), 4);
        assert_eq!(
            descriptor.to_string(),
            "(IDLjava/lang/Thread;)Ljava/lang/Object;"
        );

        Ok(())
    }

    #[test]
    fn it_formats_user_form_names() -> Result<()> {
        let ints = FieldType::Base(BaseType::from_array_code(10).unwrap()).array_of();
        assert_eq!(ints.user_form(), "int[]");
        assert_eq!(ints.to_string(), "[I");

        let strings = FieldType::from_class_name("java/lang/String")?.array_of();
        assert_eq!(strings.user_form(), "java.lang.String[]");

        let matrix = FieldType::from_class_name("[[J")?;
        assert_eq!(matrix.user_form(), "long[][]");

        Ok(())
    }

    #[test]
    fn it_reads_and_patches_slices() -> Result<()> {
        let mut code = vec![0xa7, 0xff, 0xfd, 0x00, 0x00, 0x00, 0x10];

        assert_eq!(code.i16_at(1)?, -3);
        assert_eq!(code.u32_at(3)?, 16);

        code.put_i16_at(1, 300)?;
        assert_eq!(code.u16_at(1)?, 300);

        assert!(code.i32_at(5).is_err());
        assert!(code.put_u16_at(6, 1).is_err());

        Ok(())
    }

    #[test]
    fn it_reports_exhausted_buffers() -> Result<()> {
        let mut bytes = Bytes::from_static(&[0xca, 0xfe, 0xba]);

        assert_eq!(bytes.try_get_u16()?, 0xcafe);
        assert!(bytes.try_get_u16().is_err());
        assert!(bytes.try_skip(2).is_err());

        Ok(())
    }
}
