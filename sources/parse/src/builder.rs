use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::attributes::ExceptionEntry;
use crate::classfile::LineNumber;
use crate::constants::{
    CODE_ATTRIBUTE, LINE_NUMBER_TABLE_ATTRIBUTE, MAGIC, SOURCE_FILE_ATTRIBUTE,
};
use crate::flags::{ClassFileAccessFlags, FieldAccessFlags, MethodAccessFlags};
use crate::pool::{ConstantEntry, ConstantPool, MemberEntry, NameAndTypeEntry};

#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub line_numbers: Vec<LineNumber>,
}

impl MethodBody {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        Self {
            max_stack,
            max_locals,
            code,
            ..Self::default()
        }
    }
}

struct MethodSpec {
    flags: MethodAccessFlags,
    name: u16,
    descriptor: u16,
    body: Option<MethodBody>,
}

struct FieldSpec {
    flags: FieldAccessFlags,
    name: u16,
    descriptor: u16,
}

/// Assembles well-formed class files from a constant pool and method bodies.
/// Pool entries are deduplicated, so asking for the same reference twice
/// returns the same index.
pub struct ClassBuilder {
    pool: ConstantPool,
    interned: HashMap<ConstantEntry, u16>,
    major_version: u16,
    access_flags: ClassFileAccessFlags,
    this_class: u16,
    super_class: u16,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
    source_file: Option<u16>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            pool: ConstantPool::new(),
            interned: HashMap::new(),
            // Java 5, the last version that verifies without StackMapTable
            major_version: 49,
            access_flags: ClassFileAccessFlags::PUBLIC | ClassFileAccessFlags::SUPER,
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        };

        builder.this_class = builder.class(name);
        if let Some(super_name) = super_name {
            builder.super_class = builder.class(super_name);
        }

        builder
    }

    pub fn major_version(&mut self, version: u16) -> &mut Self {
        self.major_version = version;
        self
    }

    fn intern(&mut self, entry: ConstantEntry) -> u16 {
        if let Some(index) = self.interned.get(&entry) {
            return *index;
        }

        let index = self.pool.count();
        self.interned.insert(entry.clone(), index);
        self.pool.insert(entry);
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        self.intern(ConstantEntry::Utf8(value.to_string()))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        self.intern(ConstantEntry::Class(name))
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let value = self.utf8(value);
        self.intern(ConstantEntry::String(value))
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.intern(ConstantEntry::Long(value as u64))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.intern(ConstantEntry::NameAndType(NameAndTypeEntry { name, descriptor }))
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.intern(ConstantEntry::Method(MemberEntry {
            class,
            name_and_type,
        }))
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.intern(ConstantEntry::Field(MemberEntry {
            class,
            name_and_type,
        }))
    }

    pub fn field(&mut self, flags: FieldAccessFlags, name: &str, descriptor: &str) -> &mut Self {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.fields.push(FieldSpec {
            flags,
            name,
            descriptor,
        });
        self
    }

    /// Adds a method. `None` as the body declares a method without a Code
    /// attribute, which only makes sense for native or abstract methods.
    pub fn method(
        &mut self,
        flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        body: Option<MethodBody>,
    ) -> &mut Self {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);

        if body.is_some() {
            self.utf8(CODE_ATTRIBUTE);
        }

        if body.as_ref().map_or(false, |b| !b.line_numbers.is_empty()) {
            self.utf8(LINE_NUMBER_TABLE_ATTRIBUTE);
        }

        self.methods.push(MethodSpec {
            flags,
            name,
            descriptor,
            body,
        });
        self
    }

    pub fn source_file(&mut self, name: &str) -> &mut Self {
        self.utf8(SOURCE_FILE_ATTRIBUTE);
        let name = self.utf8(name);
        self.source_file = Some(name);
        self
    }

    fn write_code(&self, body: &MethodBody, out: &mut BytesMut) {
        let mut attribute = BytesMut::new();
        attribute.put_u16(body.max_stack);
        attribute.put_u16(body.max_locals);
        attribute.put_u32(body.code.len() as u32);
        attribute.put_slice(&body.code);

        attribute.put_u16(body.exception_table.len() as u16);
        for entry in &body.exception_table {
            attribute.put_u16(entry.start_pc);
            attribute.put_u16(entry.end_pc);
            attribute.put_u16(entry.handler_pc);
            attribute.put_u16(entry.catch_type);
        }

        if body.line_numbers.is_empty() {
            attribute.put_u16(0);
        } else {
            attribute.put_u16(1);
            attribute.put_u16(self.lookup_utf8(LINE_NUMBER_TABLE_ATTRIBUTE));
            attribute.put_u32(2 + body.line_numbers.len() as u32 * 4);
            attribute.put_u16(body.line_numbers.len() as u16);
            for line in &body.line_numbers {
                attribute.put_u16(line.start_pc);
                attribute.put_u16(line.line);
            }
        }

        out.put_u16(self.lookup_utf8(CODE_ATTRIBUTE));
        out.put_u32(attribute.len() as u32);
        out.put_slice(&attribute);
    }

    fn lookup_utf8(&self, value: &str) -> u16 {
        // Every attribute name is interned when the owning item is added
        self.interned
            .get(&ConstantEntry::Utf8(value.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u32(MAGIC);
        out.put_u16(0);
        out.put_u16(self.major_version);

        out.put_u16(self.pool.count());
        for (_, entry) in self.pool.iter() {
            entry.write(&mut out);
        }

        out.put_u16(self.access_flags.bits());
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(0);

        out.put_u16(self.fields.len() as u16);
        for field in &self.fields {
            out.put_u16(field.flags.bits());
            out.put_u16(field.name);
            out.put_u16(field.descriptor);
            out.put_u16(0);
        }

        out.put_u16(self.methods.len() as u16);
        for method in &self.methods {
            out.put_u16(method.flags.bits());
            out.put_u16(method.name);
            out.put_u16(method.descriptor);

            match &method.body {
                Some(body) => {
                    out.put_u16(1);
                    self.write_code(body, &mut out);
                }
                None => out.put_u16(0),
            }
        }

        match self.source_file {
            Some(name) => {
                out.put_u16(1);
                out.put_u16(self.lookup_utf8(SOURCE_FILE_ATTRIBUTE));
                out.put_u32(2);
                out.put_u16(name);
            }
            None => out.put_u16(0),
        }

        out.to_vec()
    }
}
