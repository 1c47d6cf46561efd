mod harness;

use aspect_weaver::il::{parse_module, Module};
use aspect_weaver::weave::{weave_method, weave_module, AspectSpec, Error, Settings};
use harness::{counter_source, doubler_source};

fn method_of(module: &Module, class: &str, method: &str) -> aspect_weaver::il::MethodId {
    let class = module.find_class(class).unwrap();
    module.find_method(class, method).unwrap()
}

#[test]
fn weaving_twice_is_rejected() {
    let mut module = parse_module(
        r#"
        .class Program
        .method static int32 Answer()
          .aspect Recorder()
                  ldc.i4 7
                  ret
        .end
    "#,
    )
    .unwrap();
    assert_eq!(weave_module(&mut module, &Settings::new()).unwrap(), 1);

    let woven = module.clone();
    let answer = method_of(&module, "Program", "Answer");
    let result = weave_method(&mut module, answer, &AspectSpec::new("Recorder"), &Settings::new());
    assert!(matches!(
        result,
        Err(Error::AlreadyWoven { ref method }) if method == "Program::Answer"
    ));
    assert_eq!(module, woven);
}

#[test]
fn weaving_a_state_machine_twice_is_rejected() {
    let mut module = parse_module(&counter_source(".aspect Recorder()")).unwrap();
    weave_module(&mut module, &Settings::new()).unwrap();

    let woven = module.clone();
    let count = method_of(&module, "Program", "Count");
    let result = weave_method(&mut module, count, &AspectSpec::new("Recorder"), &Settings::new());
    assert!(matches!(result, Err(Error::AlreadyWoven { .. })));
    assert_eq!(module, woven);
}

#[test]
fn failed_weave_restores_the_module() {
    let params: Vec<String> = (0..9).map(|idx| format!("int32 p{}", idx)).collect();
    let source = format!(
        r#"
        .class Program
        .method static int32 Fine()
          .aspect Recorder()
                  ldc.i4 1
                  ret
        .end
        .method static void Wide({})
          .aspect Recorder()
                  ret
        .end
    "#,
        params.join(", ")
    );
    let mut module = parse_module(&source).unwrap();
    let before = module.clone();

    let mut settings = Settings::new();
    settings.array_fallback = false;
    let result = weave_module(&mut module, &settings);
    assert!(matches!(
        result,
        Err(Error::UnsupportedArity { arity: 9, ref method }) if method == "Program::Wide"
    ));
    assert_eq!(module, before);
}

#[test]
fn missing_state_field_is_reported() {
    let source = counter_source(".aspect Recorder()").replace("<>1__state", "phase");
    let mut module = parse_module(&source).unwrap();
    let before = module.clone();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(
        result,
        Err(Error::MissingMember { ref member, ref owner, .. })
            if member == "<>1__state" && owner == "Counter"
    ));
    assert_eq!(module, before);
}

#[test]
fn missing_builder_field_is_reported() {
    let source = doubler_source(".aspect Recorder()").replace("<>t__builder", "builder");
    let mut module = parse_module(&source).unwrap();
    let before = module.clone();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(
        result,
        Err(Error::MissingMember { ref member, .. }) if member == "<>t__builder"
    ));
    assert_eq!(module, before);
}

#[test]
fn unprotected_async_body_is_unsupported() {
    // Without its catch-all region, the record doesn't look compiler-generated
    let source = doubler_source(".aspect Recorder()")
        .replace(".try TRY CATCH catch CATCH SETRESULT\n", "");
    let mut module = parse_module(&source).unwrap();
    let before = module.clone();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(
        result,
        Err(Error::UnsupportedShape { ref method, .. }) if method == "Program::Double"
    ));
    assert_eq!(module, before);
}

#[test]
fn several_descriptors_are_unsupported() {
    let mut module = parse_module(
        r#"
        .class Program
        .method static void Run()
          .aspect Recorder()
          .aspect Rewriter()
                  ret
        .end
    "#,
    )
    .unwrap();
    let before = module.clone();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(result, Err(Error::UnsupportedShape { .. })));
    assert_eq!(module, before);
}

#[test]
fn methods_without_bodies_are_rejected() {
    let mut module = parse_module(
        r#"
        .class Program
        .method static void Run()
          .aspect Recorder()
        .end
    "#,
    )
    .unwrap();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(
        result,
        Err(Error::NoBody { ref method }) if method == "Program::Run"
    ));
}

#[test]
fn malformed_bodies_are_rejected() {
    let mut module = parse_module(
        r#"
        .class Program
        .method static void Run()
          .aspect Recorder()
          START:  nop
          END:    ret
          .try END START finally START END
        .end
    "#,
    )
    .unwrap();

    let result = weave_module(&mut module, &Settings::new());
    assert!(matches!(result, Err(Error::Malformed { .. })));
}
