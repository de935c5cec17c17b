mod common;

use bytetrace::instrument::{Binding, Kind, MethodOutcome, Verification};
use bytetrace::jvm::code::{BranchInstruction, Instruction, InvokeType, OrdComparison};
use bytetrace::jvm::{MethodAccessFlags, Name};
use common::*;

/// `public static void run() { work(); }`
fn run_class() -> Vec<u8> {
    ClassBuilder::new("app/Main")
        .method(public_static(), "run", "()V", |body| {
            body.invoke(InvokeType::Static, "app/Main", "work", "()V")
                .branch(BranchInstruction::Return);
        })
        .bytes()
}

#[test]
fn entry_without_arguments() {
    let input = run_class();
    let probe = probe(Kind::Entry, "run", "onEntry", &[]);
    let outcome = transform(&input, &[probe]);

    assert_eq!(outcome.diagnostics.verification, Verification::Passed);
    assert_eq!(outcome.diagnostics.injected_sites().count(), 1);
    assert_eq!(
        described(&outcome.bytes, "run"),
        vec![
            "invokestatic traces/Trace.onEntry",
            "invokestatic app/Main.work",
            "Return",
        ]
    );
}

/// `public static int pick(int i) { if (i == 0) return 0; return 1; }`
fn pick_class() -> Vec<u8> {
    ClassBuilder::new("app/Main")
        .method(public_static(), "pick", "(I)I", |body| {
            let zero = body.label();
            body.insn(Instruction::ILoad(0))
                .branch(BranchInstruction::If(OrdComparison::EQ, zero))
                .insn(Instruction::IConst1)
                .branch(BranchInstruction::IReturn)
                .place(zero)
                .insn(Instruction::IConst0)
                .branch(BranchInstruction::IReturn);
        })
        .bytes()
}

#[test]
fn return_with_duration_at_two_returns() {
    let input = pick_class();
    let probe = probe(Kind::Return, "pick", "onReturn", &[(Binding::Duration, "J")]);
    let outcome = transform(&input, &[probe]);
    assert_eq!(outcome.diagnostics.verification, Verification::Passed);
    assert_eq!(outcome.diagnostics.injected_sites().count(), 2);

    let described = described(&outcome.bytes, "pick");

    // One start time, taken before the original first instruction
    assert_eq!(
        &described[..4],
        &[
            "LConst0",
            "LStore(1)",
            "invokestatic java/lang/System.nanoTime",
            "LStore(1)",
        ]
    );
    assert_eq!(described[4], "ILoad(0)");

    // Then the elapsed time at each return
    assert_eq!(count(&described, "invokestatic java/lang/System.nanoTime"), 3);
    assert_eq!(handler_calls(&described), 2);
    for (idx, insn) in described.iter().enumerate() {
        if insn == "invokestatic traces/Trace.onReturn" {
            assert_eq!(described[idx - 1], "LSub");
            assert_eq!(described[idx + 1], "IReturn");
        }
    }
}

#[test]
fn return_value_is_kept_for_the_caller() {
    let input = pick_class();
    let probe = probe(Kind::Return, "pick", "onReturn", &[(Binding::Return, "I")]);
    let outcome = transform(&input, &[probe]);
    assert_eq!(outcome.diagnostics.verification, Verification::Passed);

    let described = described(&outcome.bytes, "pick");
    for (idx, insn) in described.iter().enumerate() {
        if insn == "invokestatic traces/Trace.onReturn" {
            assert_eq!(described[idx - 3], "Dup");
            assert!(described[idx - 2].starts_with("IStore("));
            assert!(described[idx - 1].starts_with("ILoad("));
            assert_eq!(described[idx + 1], "IReturn");
        }
    }
    assert_eq!(handler_calls(&described), 2);
}

/// `public synchronized void touch() { work(); }`
fn synchronized_class() -> Vec<u8> {
    ClassBuilder::new("app/Main")
        .method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::SYNCHRONIZED,
            "touch",
            "()V",
            |body| {
                body.invoke(InvokeType::Static, "app/Main", "work", "()V")
                    .branch(BranchInstruction::Return);
            },
        )
        .bytes()
}

#[test]
fn synchronized_method_exit_on_every_path() {
    let input = synchronized_class();
    let probe = probe(Kind::SyncExit, "touch", "onUnlock", &[]);
    let outcome = transform(&input, &[probe]);
    assert_eq!(outcome.diagnostics.verification, Verification::Passed);

    let (code, class) = method_code(&outcome.bytes, "touch");
    let constants = &class.class_file.constants;
    let described = describe(&code, constants);

    // Before the normal return, and in the handler for exceptions
    assert_eq!(handler_calls(&described), 2);
    assert_eq!(code.try_catches.len(), 1);

    let try_catch = &code.try_catches[0];
    let catch_type = try_catch.catch_type.unwrap();
    assert_eq!(constants.class_name(catch_type).unwrap().as_str(), "java/lang/Throwable");

    let handler = handler_block(&code, constants, try_catch.handler);
    assert_eq!(handler.len(), 4);
    assert!(handler[0].starts_with("AStore("));
    assert_eq!(handler[1], "invokestatic traces/Trace.onUnlock");
    assert!(handler[2].starts_with("ALoad("));
    assert_eq!(handler[3], "AThrow");
    assert_eq!(handler[0][6..], handler[2][5..]);
}

#[test]
fn leveled_entry_is_only_prefixed_by_the_gate() {
    let input = run_class();
    let plain = probe(Kind::Entry, "run", "onEntry", &[]);
    let mut leveled = plain.clone();
    leveled.level = Some(">=3".parse().unwrap());

    let plain = described(&transform(&input, &[plain]).bytes, "run");
    let leveled = described(&transform(&input, &[leveled]).bytes, "run");

    assert_eq!(
        &leveled[..3],
        &[
            "getstatic traces/Trace.$btrace$$level",
            "IConst3",
            "IfICmp(LT)",
        ]
    );
    assert_eq!(&leveled[3..], &plain[..]);
}

#[test]
fn zero_level_needs_no_gate() {
    let input = run_class();
    let plain = probe(Kind::Entry, "run", "onEntry", &[]);
    let mut leveled = plain.clone();
    leveled.level = Some(">=0".parse().unwrap());

    let plain = described(&transform(&input, &[plain]).bytes, "run");
    let leveled = described(&transform(&input, &[leveled]).bytes, "run");
    assert_eq!(leveled, plain);
}

#[test]
fn unmatched_method_is_untouched() {
    let input = run_class();
    let probe = probe(Kind::Entry, "other", "onEntry", &[]);
    let outcome = transform(&input, &[probe]);

    assert_eq!(outcome.bytes, input);
    assert!(outcome.diagnostics.methods.is_empty());
    assert_eq!(outcome.diagnostics.verification, Verification::NotNeeded);
}

#[test]
fn method_without_sites_is_unchanged() {
    let input = run_class();
    let probe = probe(Kind::Throw, "run", "onThrow", &[]);
    let outcome = transform(&input, &[probe]);

    assert_eq!(outcome.bytes, input);
    assert_eq!(outcome.diagnostics.methods.len(), 1);
    assert!(matches!(
        outcome.diagnostics.methods[0].outcome,
        MethodOutcome::Unchanged
    ));
}
