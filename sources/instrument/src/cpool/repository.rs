//! The constant pool entries each kind of instrumentation adds to a class,
//! and where the methods it calls sit within them.

use lazy_static::lazy_static;

use super::fragment::{CpEntry, CpIndex, PackedFragment};
use crate::kind::InjectionKind;

use CpIndex::{External, Internal};

/// A class of the profiler's server runtime package.
macro_rules! runtime_class {
    ($name:literal) => {
        concat!("org/netbeans/lib/profiler/server/", $name)
    };
}

pub const CPU_FULL_RUNTIME: &str = runtime_class!("ProfilerRuntimeCPUFullInstr");
pub const CPU_SAMPLED_RUNTIME: &str = runtime_class!("ProfilerRuntimeCPUSampledInstr");
pub const CPU_RUNTIME: &str = runtime_class!("ProfilerRuntimeCPU");
pub const CODE_REGION_RUNTIME: &str = runtime_class!("ProfilerRuntimeCPUCodeRegion");
pub const ALLOCATION_RUNTIME: &str = runtime_class!("ProfilerRuntimeObjAlloc");
pub const LIVENESS_RUNTIME: &str = runtime_class!("ProfilerRuntimeObjLiveness");

const CHAR_VOID: &str = "(C)V";
const VOID_VOID: &str = "()V";
const OBJECT_CHAR_VOID: &str = "(Ljava/lang/Object;C)V";
const OBJECT_VOID: &str = "(Ljava/lang/Object;)V";
const REFLECT_METHOD_VOID: &str = "(Ljava/lang/reflect/Method;)V";

// Positions of Methodref entries, relative to the fragment's base
pub const METHOD_ENTRY: u16 = 3;
pub const METHOD_EXIT: u16 = 6;
pub const PROFILE_POINT_HIT: u16 = 9;
pub const ROOT_ENTRY: u16 = 0;
pub const MARKER_ENTRY: u16 = 0;
pub const MARKER_EXIT: u16 = 3;
/// `markerMethodExit(Object, char)`, reporting the object a method returns.
pub const MARKER_EXIT_WITH_RESULT: u16 = 7;
pub const REFLECT_INVOKE: u16 = 3;
pub const SERVLET_DO_METHOD: u16 = 3;
pub const CODE_REGION_ENTRY: u16 = 3;
pub const CODE_REGION_EXIT: u16 = 6;
pub const TRACE_ALLOCATION: u16 = 4;
pub const MEMORY_PROFILE_POINT_HIT: u16 = 7;

pub const ADD_PARAMETER_OVERLOADS: usize = 9;

/// Signatures of the runtime's `addParameter` overloads, in the order
/// their Methodrefs follow each other in the marker fragment.
pub const ADD_PARAMETER_SIGNATURES: [&str; ADD_PARAMETER_OVERLOADS] = [
    "(Z)V",
    "(C)V",
    "(B)V",
    "(S)V",
    "(I)V",
    "(J)V",
    "(F)V",
    "(D)V",
    OBJECT_VOID,
];

const ADD_PARAMETER_FIRST: u16 = 14;

/// Position of the Methodref for one of [`ADD_PARAMETER_SIGNATURES`].
pub fn add_parameter(overload: usize) -> u16 {
    ADD_PARAMETER_FIRST + 3 * overload as u16
}

// Entries of the normal fragment that root and marker fragments share
const NORMAL_CHAR_VOID: u16 = 0;
const NORMAL_RUNTIME_CLASS: u16 = 1;

lazy_static! {
    static ref FRAGMENTS: Vec<PackedFragment> = InjectionKind::ALL
        .iter()
        .map(|&kind| PackedFragment::pack(&entries(kind)))
        .collect();
}

pub fn fragment(kind: InjectionKind) -> &'static PackedFragment {
    &FRAGMENTS[kind.index()]
}

/// Appends Methodref, NameAndType and name entries for one runtime method,
/// returning the Methodref's position.
fn call(entries: &mut Vec<CpEntry>, class: CpIndex, name: &'static str, signature: CpIndex) -> u16 {
    let method = entries.len() as u16;
    entries.push(CpEntry::MethodRef {
        class,
        name_and_type: Internal(method + 1),
    });
    entries.push(CpEntry::NameAndType {
        name: Internal(method + 2),
        descriptor: signature,
    });
    entries.push(CpEntry::Utf8(name));
    method
}

/// Signature, class and class name entries followed by the given calls.
fn runtime_calls(
    signature: &'static str,
    runtime: &'static str,
    calls: &[&'static str],
) -> Vec<CpEntry> {
    let mut entries = vec![
        CpEntry::Utf8(signature),
        CpEntry::Class(Internal(2)),
        CpEntry::Utf8(runtime),
    ];

    for name in calls {
        call(&mut entries, Internal(1), name, Internal(0));
    }

    entries
}

fn dependent_calls(calls: &[&'static str]) -> Vec<CpEntry> {
    let mut entries = Vec::new();
    for name in calls {
        call(
            &mut entries,
            External(NORMAL_RUNTIME_CLASS),
            name,
            External(NORMAL_CHAR_VOID),
        );
    }

    entries
}

/// Marker entry and exit, the exit carrying a returned object, and the
/// calls that hand each argument of a marker method to the runtime.
fn marker() -> Vec<CpEntry> {
    let mut entries = dependent_calls(&["markerMethodEntry", "markerMethodExit"]);

    let signature = entries.len() as u16;
    entries.push(CpEntry::Utf8(OBJECT_CHAR_VOID));
    call(
        &mut entries,
        External(NORMAL_RUNTIME_CLASS),
        "markerMethodExit",
        Internal(signature),
    );

    let class = entries.len() as u16;
    entries.push(CpEntry::Class(Internal(class + 1)));
    entries.push(CpEntry::Utf8(CPU_RUNTIME));

    let name = entries.len() as u16;
    entries.push(CpEntry::Utf8("addParameter"));

    for parameter in ADD_PARAMETER_SIGNATURES {
        let descriptor = entries.len() as u16;
        entries.push(CpEntry::Utf8(parameter));
        entries.push(CpEntry::MethodRef {
            class: Internal(class),
            name_and_type: Internal(descriptor + 2),
        });
        entries.push(CpEntry::NameAndType {
            name: Internal(name),
            descriptor: Internal(descriptor),
        });
    }

    entries
}

fn memory(runtime: &'static str) -> Vec<CpEntry> {
    let mut entries = vec![
        CpEntry::Utf8(OBJECT_CHAR_VOID),
        CpEntry::Utf8(CHAR_VOID),
        CpEntry::Class(Internal(3)),
        CpEntry::Utf8(runtime),
    ];

    call(&mut entries, Internal(2), "traceObjAlloc", Internal(0));
    call(&mut entries, Internal(2), "profilePointHit", Internal(1));
    entries
}

pub(crate) fn entries(kind: InjectionKind) -> Vec<CpEntry> {
    let normal = ["methodEntry", "methodExit", "profilePointHit"];

    match kind {
        InjectionKind::NormalMethod => runtime_calls(CHAR_VOID, CPU_FULL_RUNTIME, &normal),
        InjectionKind::SampledNormalMethod => {
            runtime_calls(CHAR_VOID, CPU_SAMPLED_RUNTIME, &normal)
        }
        InjectionKind::RootMethod | InjectionKind::SampledRootMethod => {
            dependent_calls(&["rootMethodEntry"])
        }
        InjectionKind::MarkerMethod | InjectionKind::SampledMarkerMethod => marker(),
        InjectionKind::ReflectMethodInvoke => runtime_calls(
            REFLECT_METHOD_VOID,
            CPU_RUNTIME,
            &["handleJavaLangReflectMethodInvoke"],
        ),
        InjectionKind::ServletDoMethod => {
            runtime_calls(OBJECT_VOID, CPU_RUNTIME, &["handleServletDoMethod"])
        }
        InjectionKind::CodeRegion => runtime_calls(
            VOID_VOID,
            CODE_REGION_RUNTIME,
            &["codeRegionEntry", "codeRegionExit"],
        ),
        InjectionKind::ObjectAllocations => memory(ALLOCATION_RUNTIME),
        InjectionKind::ObjectLiveness => memory(LIVENESS_RUNTIME),
    }
}
