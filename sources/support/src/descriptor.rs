use std::{fmt, iter::Peekable, str::Chars};

use anyhow::{anyhow, Result};
use enum_as_inner::EnumAsInner;

/// <BaseType> ::= 'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z'
#[derive(EnumAsInner, Debug, PartialEq, Eq, Clone, Copy)]
pub enum BaseType {
    Boolean, // Z
    Char,    // C
    Float,   // F
    Double,  // D
    Byte,    // B
    Short,   // S
    Int,     // I
    Long,    // J
    Void,    // V
}

impl BaseType {
    /// Maps the `atype` operand of `newarray` to its element type.
    pub fn from_array_code(code: u8) -> Option<Self> {
        Some(match code {
            4 => BaseType::Boolean,
            5 => BaseType::Char,
            6 => BaseType::Float,
            7 => BaseType::Double,
            8 => BaseType::Byte,
            9 => BaseType::Short,
            10 => BaseType::Int,
            11 => BaseType::Long,
            _ => return None,
        })
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            BaseType::Boolean => "boolean",
            BaseType::Char => "char",
            BaseType::Float => "float",
            BaseType::Double => "double",
            BaseType::Byte => "byte",
            BaseType::Short => "short",
            BaseType::Int => "int",
            BaseType::Long => "long",
            BaseType::Void => "void",
        }
    }

    /// Longs and doubles take two local variable slots.
    pub fn slots(&self) -> usize {
        match self {
            BaseType::Long | BaseType::Double => 2,
            BaseType::Void => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            BaseType::Boolean => "Z",
            BaseType::Char => "C",
            BaseType::Float => "F",
            BaseType::Double => "D",
            BaseType::Byte => "B",
            BaseType::Short => "S",
            BaseType::Int => "I",
            BaseType::Long => "J",
            BaseType::Void => "V",
        };

        write!(f, "{}", c)
    }
}

/// <FieldType> ::= <BaseType> | <ObjectType> | <ArrayType>
#[derive(EnumAsInner, Debug, PartialEq, Eq, Clone)]
pub enum FieldType {
    Base(BaseType),
    Object(String),
    Array(Box<FieldType>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Base(base) => write!(f, "{}", base),
            FieldType::Object(class_name) => write!(f, "L{};", class_name),
            FieldType::Array(component) => write!(f, "[{}", component),
        }
    }
}

impl FieldType {
    fn parse_from_iterator(chars: &mut Peekable<Chars>) -> Result<Self> {
        let first = chars.next().ok_or(anyhow!("no more chars"))?;

        Ok(match first {
            'B' => FieldType::Base(BaseType::Byte),
            'C' => FieldType::Base(BaseType::Char),
            'D' => FieldType::Base(BaseType::Double),
            'F' => FieldType::Base(BaseType::Float),
            'I' => FieldType::Base(BaseType::Int),
            'J' => FieldType::Base(BaseType::Long),
            'S' => FieldType::Base(BaseType::Short),
            'Z' => FieldType::Base(BaseType::Boolean),
            'V' => FieldType::Base(BaseType::Void),
            '[' => FieldType::Array(Box::new(FieldType::parse_from_iterator(chars)?)),
            'L' => {
                let class_name = chars.take_while(|c| *c != ';').collect::<String>();
                if class_name.is_empty() {
                    return Err(anyhow!("empty class name in descriptor"));
                }

                FieldType::Object(class_name)
            }
            _ => return Err(anyhow!("unknown type {first}")),
        })
    }

    pub fn parse(str: &str) -> Result<Self> {
        let mut chars = str.chars().peekable();
        let ty = FieldType::parse_from_iterator(&mut chars)?;

        if chars.next().is_some() {
            return Err(anyhow!("trailing characters in descriptor {str}"));
        }

        Ok(ty)
    }

    /// Interprets a constant pool class name: array classes are stored as
    /// descriptors, everything else as a bare internal name.
    pub fn from_class_name(name: &str) -> Result<Self> {
        if name.starts_with('[') {
            FieldType::parse(name)
        } else {
            Ok(FieldType::Object(name.to_string()))
        }
    }

    pub fn array_of(self) -> Self {
        FieldType::Array(Box::new(self))
    }

    /// The name as a Java programmer writes it, `java.lang.String[][]`.
    pub fn user_form(&self) -> String {
        match self {
            FieldType::Base(base) => base.keyword().to_string(),
            FieldType::Object(class_name) => class_name.replace('/', "."),
            FieldType::Array(component) => format!("{}[]", component.user_form()),
        }
    }

    pub fn slots(&self) -> usize {
        match self {
            FieldType::Base(base) => base.slots(),
            _ => 1,
        }
    }
}

/// <MethodType> ::= '(' { <FieldType> } ')' <FieldType>
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MethodType {
    pub parameters: Vec<FieldType>,
    pub return_type: FieldType,
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for parameter in &self.parameters {
            write!(f, "{}", parameter)?;
        }
        write!(f, "){}", self.return_type)
    }
}

impl MethodType {
    pub fn parse(str: &str) -> Result<Self> {
        let mut chars = str.chars().peekable();
        if chars.next() != Some('(') {
            return Err(anyhow!("descriptor did not start with ("));
        }

        let mut parameters = Vec::new();

        while chars.peek() != Some(&')') {
            if chars.peek().is_none() {
                return Err(anyhow!("unterminated parameter list in {str}"));
            }
            parameters.push(FieldType::parse_from_iterator(&mut chars)?);
        }

        // Skip )
        chars.next();

        let return_type = FieldType::parse_from_iterator(&mut chars)?;

        Ok(MethodType {
            parameters,
            return_type,
        })
    }

    /// Local variable slots taken by the parameters, excluding `this`.
    pub fn argument_slots(&self) -> usize {
        self.parameters.iter().map(FieldType::slots).sum()
    }
}
