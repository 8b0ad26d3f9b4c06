use anyhow::Result;
use instrument::{
    bytecode,
    cpool::repository::{self, METHOD_ENTRY, METHOD_EXIT, TRACE_ALLOCATION},
    opcode::*,
    Injection, InjectionKind, InstrumentConfig, InstrumentError, InstrumentationFilter,
    Instrumentor, MemoryMode, MethodRole, MethodTarget, ProfilePoint,
};
use parse::{
    attributes::ExceptionEntry,
    builder::{ClassBuilder, MethodBody},
    classfile::ClassInfo,
    flags::MethodAccessFlags,
};
use util::{code_of, init_logging, single_method, split};

mod util;

const LOADER: u32 = 1;

fn entry_exit(method: usize) -> MethodTarget {
    MethodTarget::new(method, Injection::EntryExit(MethodRole::Normal))
}

fn call(id: u16, method: u16) -> Vec<u8> {
    let [id_hi, id_lo] = split(id);
    let [hi, lo] = split(method);
    vec![SIPUSH, id_hi, id_lo, INVOKESTATIC, hi, lo, NOP, NOP]
}

fn read_i32(code: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

#[test]
fn it_wraps_an_empty_method() -> Result<()> {
    init_logging();
    let bytes = single_method("demo/Empty", "()V", MethodBody::new(0, 0, vec![RETURN]));
    let original = ClassInfo::parse(&bytes)?;

    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    let result = session.instrument_class("demo/Empty", LOADER, &[entry_exit(0)])?;

    assert_eq!(result.instrumented, vec![0]);
    assert_eq!(result.method_ids, vec![(0, 0)]);
    assert_eq!(result.leaf_methods, vec![0]);

    let class = ClassInfo::parse(&result.bytes)?;
    let entry = original.pool_count() + METHOD_ENTRY;
    let exit = original.pool_count() + METHOD_EXIT;

    let mut expected = call(0, entry);
    expected.extend(call(0, exit));
    expected.push(RETURN);
    let [hi, lo] = split(exit);
    expected.extend([ASTORE_1, SIPUSH, 0, 0, INVOKESTATIC, hi, lo, ALOAD_1, ATHROW]);

    let code = class.code_attribute(0)?;
    assert_eq!(code.code, expected);
    assert_eq!(
        code.exception_table,
        vec![ExceptionEntry {
            start_pc: 0,
            end_pc: 17,
            handler_pc: 17,
            catch_type: 0,
        }]
    );
    assert_eq!(code.max_locals, 2);
    assert_eq!(code.max_stack, 3);

    assert_eq!(class.pool_count(), original.pool_count() + 12);
    let member = class.member_ref(entry)?;
    assert_eq!(member.class, repository::CPU_FULL_RUNTIME);
    assert_eq!(member.name, "methodEntry");
    assert_eq!(member.descriptor, "(C)V");

    Ok(())
}

#[test]
fn it_traces_a_discarded_allocation() -> Result<()> {
    init_logging();
    let mut builder = ClassBuilder::new("demo/Discard", Some("java/lang/Object"));
    let widget = builder.class("demo/Widget");
    let init = builder.method_ref("demo/Widget", "<init>", "()V");

    // new Widget();
    let mut code = vec![NEW];
    code.extend(split(widget));
    code.push(DUP);
    code.push(INVOKESPECIAL);
    code.extend(split(init));
    code.extend([POP, RETURN]);

    builder.method(
        MethodAccessFlags::STATIC,
        "run",
        "()V",
        Some(MethodBody::new(2, 0, code.clone())),
    );
    let bytes = builder.build();

    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    let result = session.instrument_class(
        "demo/Discard",
        LOADER,
        &[MethodTarget::new(0, Injection::ObjectAllocation(MemoryMode::Allocations))],
    )?;

    let trace = session
        .class("demo/Discard", LOADER)
        .and_then(|c| c.index_of(InjectionKind::ObjectAllocations, TRACE_ALLOCATION))
        .unwrap();

    let class = ClassInfo::parse(&result.bytes)?;
    let [hi, lo] = split(trace);

    let mut expected = code[..7].to_vec();
    expected.extend([DUP, SIPUSH, 0, 1, INVOKESTATIC, hi, lo, NOP]);
    expected.extend([POP, RETURN]);

    assert_eq!(code_of(&class, "run", "()V")?, expected);
    assert_eq!(class.code_attribute(0)?.max_stack, 2 + 2 + 2);

    let member = class.member_ref(trace)?;
    assert_eq!(member.class, repository::ALLOCATION_RUNTIME);
    assert_eq!(member.name, "traceObjAlloc");

    Ok(())
}

#[test]
fn it_relinks_switch_targets() -> Result<()> {
    init_logging();
    // switch (x) { case 0: return; case 1: return; default: return; }
    let mut code = vec![ILOAD, 0, TABLESWITCH, 0];
    code.extend(24i32.to_be_bytes());
    code.extend(0i32.to_be_bytes());
    code.extend(1i32.to_be_bytes());
    code.extend(22i32.to_be_bytes());
    code.extend(23i32.to_be_bytes());
    code.extend([RETURN, RETURN, RETURN]);

    let bytes = single_method("demo/Switch", "(I)V", MethodBody::new(1, 1, code));
    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    let result = session.instrument_class("demo/Switch", LOADER, &[entry_exit(0)])?;

    let class = ClassInfo::parse(&result.bytes)?;
    let code = code_of(&class, "run", "(I)V")?;

    // the switch moved by 8 and keeps its single padding byte
    assert_eq!(&code[8..12], &[ILOAD, 0, TABLESWITCH, 0]);

    // every target now lands on the exit call in front of its return
    assert_eq!(read_i32(&code, 12), 40);
    assert_eq!(read_i32(&code, 24), 22);
    assert_eq!(read_i32(&code, 28), 31);
    assert_eq!(&code[32..35], &[SIPUSH, 0, 0]);
    assert_eq!(code[40], RETURN);
    assert_eq!(code[49], RETURN);
    assert_eq!(code[58], RETURN);

    // and the new code still decodes end to end
    let instructions = bytecode::scan(&code)?;
    let last = instructions.last().unwrap();
    assert_eq!(last.next(), code.len());
    assert_eq!(last.opcode, ATHROW);

    Ok(())
}

#[test]
fn it_keeps_exception_ranges_on_their_code() -> Result<()> {
    init_logging();
    // try { return 0; } catch (Throwable t) { return 1; }
    let mut body = MethodBody::new(1, 0, vec![ICONST_0, IRETURN, POP, ICONST_1, IRETURN]);
    body.exception_table.push(ExceptionEntry {
        start_pc: 0,
        end_pc: 2,
        handler_pc: 2,
        catch_type: 0,
    });

    let bytes = single_method("demo/Guarded", "()I", body);
    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    let result = session.instrument_class("demo/Guarded", LOADER, &[entry_exit(0)])?;

    let class = ClassInfo::parse(&result.bytes)?;
    let code = class.code_attribute(0)?;

    assert_eq!(code.code[18], POP);
    assert_eq!(
        code.exception_table,
        vec![
            ExceptionEntry {
                start_pc: 0,
                end_pc: 18,
                handler_pc: 18,
                catch_type: 0,
            },
            ExceptionEntry {
                start_pc: 0,
                end_pc: 29,
                handler_pc: 29,
                catch_type: 0,
            },
        ]
    );

    Ok(())
}

#[test]
fn it_extends_the_pool_once_per_kind() -> Result<()> {
    init_logging();
    let mut builder = ClassBuilder::new("demo/Twice", Some("java/lang/Object"));
    for name in ["first", "second", "third"] {
        builder.method(
            MethodAccessFlags::STATIC,
            name,
            "()V",
            Some(MethodBody::new(0, 0, vec![RETURN])),
        );
    }
    let bytes = builder.build();
    let original = ClassInfo::parse(&bytes)?;

    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    session.instrument_class("demo/Twice", LOADER, &[entry_exit(0)])?;
    let result = session.instrument_class(
        "demo/Twice",
        LOADER,
        &[
            entry_exit(1),
            MethodTarget::new(2, Injection::EntryExit(MethodRole::Root)),
        ],
    )?;

    let class = ClassInfo::parse(&result.bytes)?;
    // normal fragment once, root fragment on top of it
    assert_eq!(class.pool_count(), original.pool_count() + 12 + 3);
    assert_eq!(result.method_ids, vec![(0, 0), (1, 1), (2, 2)]);

    // the root entry call reaches the normal fragment's class
    let root_entry = original.pool_count() + 12;
    let member = class.member_ref(root_entry)?;
    assert_eq!(member.class, repository::CPU_FULL_RUNTIME);
    assert_eq!(member.name, "rootMethodEntry");

    Ok(())
}

#[test]
fn it_filters_allocations_by_class_name() -> Result<()> {
    init_logging();
    let mut builder = ClassBuilder::new("demo/Arrays", Some("java/lang/Object"));
    let strings = builder.class("java/lang/String");

    // new int[1]; new String[1];
    let mut code = vec![ICONST_1, NEWARRAY, 10, POP, ICONST_1, ANEWARRAY];
    code.extend(split(strings));
    code.extend([POP, RETURN]);
    builder.method(
        MethodAccessFlags::STATIC,
        "run",
        "()V",
        Some(MethodBody::new(1, 0, code)),
    );

    let config = InstrumentConfig {
        filter: InstrumentationFilter::new().exclude("java."),
        ..InstrumentConfig::default()
    };

    let mut session = Instrumentor::new(config);
    session.load_class(&builder.build(), LOADER)?;
    let result = session.instrument_class(
        "demo/Arrays",
        LOADER,
        &[MethodTarget::new(0, Injection::ObjectAllocation(MemoryMode::Allocations))],
    )?;

    let class = ClassInfo::parse(&result.bytes)?;
    let code = code_of(&class, "run", "()V")?;

    // only the int[] is traced
    assert_eq!(&code[..4], &[ICONST_1, NEWARRAY, 10, DUP]);
    assert_eq!(code.len(), 10 + 8);
    assert_eq!(code[11], POP);

    Ok(())
}

#[test]
fn it_reports_profile_points_with_entry_exit() -> Result<()> {
    init_logging();
    let bytes = single_method(
        "demo/Points",
        "()V",
        MethodBody::new(1, 0, vec![ICONST_0, POP, RETURN]),
    );
    let original = ClassInfo::parse(&bytes)?;

    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&bytes, LOADER)?;
    let target = entry_exit(0).with_profile_points(vec![ProfilePoint { id: 9, bci: 1 }]);
    let result = session.instrument_class("demo/Points", LOADER, &[target])?;

    let class = ClassInfo::parse(&result.bytes)?;
    let code = code_of(&class, "run", "()V")?;
    let hit = original.pool_count() + repository::PROFILE_POINT_HIT;

    assert_eq!(code[8], ICONST_0);
    assert_eq!(&code[9..17], call(9, hit).as_slice());
    assert_eq!(code[17], POP);
    assert_eq!(class.member_ref(hit)?.name, "profilePointHit");

    Ok(())
}

#[test]
fn it_skips_methods_without_failing_the_class() -> Result<()> {
    init_logging();
    let mut builder = ClassBuilder::new("demo/Mixed", Some("java/lang/Object"));
    builder
        .method(
            MethodAccessFlags::STATIC | MethodAccessFlags::NATIVE,
            "native",
            "()V",
            None,
        )
        .method(
            MethodAccessFlags::STATIC,
            "plain",
            "()V",
            Some(MethodBody::new(0, 0, vec![RETURN])),
        );

    let mut session = Instrumentor::new(InstrumentConfig::default());
    session.load_class(&builder.build(), LOADER)?;
    let result = session.instrument_class(
        "demo/Mixed",
        LOADER,
        &[
            entry_exit(0),
            MethodTarget::new(1, Injection::CodeRegion(0..5)),
            entry_exit(1),
        ],
    )?;

    assert_eq!(result.instrumented, vec![1]);
    assert_eq!(result.skipped.len(), 2);
    assert!(matches!(result.skipped[0], (0, InstrumentError::Unscannable { .. })));
    assert!(matches!(result.skipped[1], (1, InstrumentError::Skipped { .. })));

    ClassInfo::parse(&result.bytes)?;
    Ok(())
}
