//! Small classes and traces to transform, and ways of looking at what came out

#![allow(dead_code)]

use bytetrace::instrument::{
    Binding, ClassModel, Handler, Instrumentor, Kind, Location, MethodPattern, NamePattern,
    ProbeDescriptor, Sampling, TransformOutcome,
};
use bytetrace::jvm::class_file::{
    self, BytecodeArray, ClassFile, ConstantsPool, Method, Version,
};
use bytetrace::jvm::code::encode::encode;
use bytetrace::jvm::code::{
    BranchInstruction, Code, Instruction, InvokeType, LabelGenerator, Node, SynLabel,
    SynLabelGenerator, TryCatch,
};
use bytetrace::jvm::hierarchy::{ClassInfo, KnownClasses};
use bytetrace::jvm::verifier::MethodContext;
use bytetrace::jvm::{
    BinaryName, ClassAccessFlags, FieldType, MethodAccessFlags, MethodDescriptor, Name,
    ParseDescriptor, RefType, UnqualifiedName,
};

pub const TRACE: &str = "traces/Trace";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn binary(name: &str) -> BinaryName {
    BinaryName::from_string(String::from(name)).unwrap()
}

pub fn unqualified(name: &str) -> UnqualifiedName {
    UnqualifiedName::from_string(String::from(name)).unwrap()
}

pub fn field_type(descriptor: &str) -> FieldType<BinaryName> {
    FieldType::parse(descriptor).unwrap()
}

pub fn method_descriptor(descriptor: &str) -> MethodDescriptor<BinaryName> {
    MethodDescriptor::parse(descriptor).unwrap()
}

/// `java.lang`, plus `app/Base`, `app/Main extends app/Base`, and `app/Derived extends app/Base`
pub fn hierarchy() -> KnownClasses {
    let mut classes = KnownClasses::with_java_lang();
    classes.insert(binary("app/Base"), ClassInfo::class(BinaryName::OBJECT));
    classes.insert(binary("app/Main"), ClassInfo::class(binary("app/Base")));
    classes.insert(binary("app/Derived"), ClassInfo::class(binary("app/Base")));
    classes
}

/// Method body being put together
pub struct Body<'a> {
    pub constants: &'a mut ConstantsPool,
    pub nodes: Vec<Node>,
    pub try_catches: Vec<TryCatch>,
    labels: SynLabelGenerator,
}

impl<'a> Body<'a> {
    pub fn insn(&mut self, insn: Instruction) -> &mut Self {
        self.nodes.push(Node::Insn(insn));
        self
    }

    pub fn branch(&mut self, branch: BranchInstruction<SynLabel, SynLabel>) -> &mut Self {
        self.nodes.push(Node::Branch(branch));
        self
    }

    pub fn line(&mut self, line: u16) -> &mut Self {
        self.nodes.push(Node::Line(line));
        self
    }

    pub fn label(&mut self) -> SynLabel {
        self.labels.fresh_label()
    }

    pub fn place(&mut self, label: SynLabel) -> &mut Self {
        self.nodes.push(Node::Label(label));
        self
    }

    pub fn invoke(&mut self, invoke: InvokeType, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        let method = self
            .constants
            .get_method_ref(&binary(owner), &unqualified(name), &method_descriptor(descriptor), false)
            .unwrap();
        self.insn(Instruction::Invoke(invoke, method))
    }

    pub fn get_static(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        let field = self.field(owner, name, descriptor);
        self.insn(Instruction::GetStatic(field))
    }

    pub fn get_field(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        let field = self.field(owner, name, descriptor);
        self.insn(Instruction::GetField(field))
    }

    pub fn put_static(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        let field = self.field(owner, name, descriptor);
        self.insn(Instruction::PutStatic(field))
    }

    pub fn new_object(&mut self, class: &str) -> &mut Self {
        let class = self.constants.get_class(&RefType::Object(binary(class))).unwrap();
        self.insn(Instruction::New(class))
    }

    pub fn catch(&mut self, start: SynLabel, end: SynLabel, handler: SynLabel, catch_type: Option<&str>) -> &mut Self {
        let catch_type = catch_type.map(|class| {
            self.constants
                .get_class(&RefType::Object(binary(class)))
                .unwrap()
        });
        self.try_catches.push(TryCatch {
            start,
            end,
            handler,
            catch_type,
        });
        self
    }

    fn field(&mut self, owner: &str, name: &str, descriptor: &str) -> bytetrace::jvm::class_file::FieldRefConstantIndex {
        self.constants
            .get_field_ref(&binary(owner), &unqualified(name), &field_type(descriptor))
            .unwrap()
    }
}

/// Class put together method by method
pub struct ClassBuilder {
    name: BinaryName,
    super_class: BinaryName,
    constants: ConstantsPool,
    methods: Vec<Method>,
    hierarchy: KnownClasses,
}

impl ClassBuilder {
    pub fn new(name: &str) -> ClassBuilder {
        ClassBuilder::with_super(name, "app/Base")
    }

    pub fn with_super(name: &str, super_class: &str) -> ClassBuilder {
        ClassBuilder {
            name: binary(name),
            super_class: binary(super_class),
            constants: ConstantsPool::new(),
            methods: vec![],
            hierarchy: hierarchy(),
        }
    }

    /// Add a method whose body is checked and encoded like any compiled one
    pub fn method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        build: impl FnOnce(&mut Body),
    ) -> &mut Self {
        let method_descriptor = method_descriptor(descriptor);
        let mut body = Body {
            constants: &mut self.constants,
            nodes: vec![],
            try_catches: vec![],
            labels: SynLabelGenerator::default(),
        };
        build(&mut body);
        let Body {
            nodes,
            try_catches,
            labels,
            ..
        } = body;

        let code = Code {
            max_stack: 0,
            max_locals: 0,
            nodes,
            try_catches,
            local_variables: vec![],
            local_variable_types: vec![],
            labels,
        };
        let context = MethodContext {
            this_class: self.name.clone(),
            descriptor: method_descriptor,
            is_static: access_flags.contains(MethodAccessFlags::STATIC),
            is_constructor: name == "<init>",
            hierarchy: &self.hierarchy,
        };
        let encoded = encode(code, &context, &mut self.constants, Version::JAVA8).unwrap();
        self.raw_method(access_flags, name, descriptor, encoded)
    }

    /// Add a method with an already encoded body
    pub fn raw_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        code: class_file::Code,
    ) -> &mut Self {
        let name_index = self.constants.get_utf8(name).unwrap();
        let descriptor_index = self.constants.get_utf8(descriptor).unwrap();
        let code = self.constants.get_attribute(code).unwrap();
        self.methods.push(Method {
            access_flags,
            name_index,
            descriptor_index,
            attributes: vec![code],
        });
        self
    }

    /// Add a method whose body is just these bytes
    pub fn bytecode_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        bytes: Vec<u8>,
    ) -> &mut Self {
        let code = class_file::Code {
            max_stack,
            max_locals: 1,
            code_array: BytecodeArray(bytes),
            exception_table: vec![],
            attributes: vec![],
        };
        self.raw_method(access_flags, name, descriptor, code)
    }

    pub fn bytes(&mut self) -> Vec<u8> {
        let this_class = self
            .constants
            .get_class(&RefType::Object(self.name.clone()))
            .unwrap();
        let super_class = self
            .constants
            .get_class(&RefType::Object(self.super_class.clone()))
            .unwrap();
        let class_file = ClassFile {
            version: Version::JAVA8,
            constants: std::mem::replace(&mut self.constants, ConstantsPool::new()),
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: std::mem::take(&mut self.methods),
            attributes: vec![],
        };
        class_file.to_bytes().unwrap()
    }
}

pub fn public_static() -> MethodAccessFlags {
    MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC
}

/// Probe on `app.Main` calling `traces.Trace.<handler>`, with one parameter per binding
pub fn probe(kind: Kind, method: &str, handler: &str, bindings: &[(Binding, &str)]) -> ProbeDescriptor {
    ProbeDescriptor {
        trace_class: binary(TRACE),
        handler: Handler {
            name: unqualified(handler),
            descriptor: MethodDescriptor {
                parameters: bindings.iter().map(|(_, desc)| field_type(desc)).collect(),
                return_type: None,
            },
        },
        class: NamePattern::parse("app.Main").unwrap(),
        method: MethodPattern {
            name: NamePattern::parse(method).unwrap(),
            descriptor: None,
        },
        location: Location::new(kind),
        bindings: bindings.iter().map(|(binding, _)| *binding).collect(),
        level: None,
        sampling: Sampling::None,
    }
}

pub fn transform(bytes: &[u8], probes: &[ProbeDescriptor]) -> TransformOutcome {
    init_logging();
    Instrumentor::default()
        .transform(bytes, &hierarchy(), probes)
        .unwrap()
}

/// Decoded body of the named method, with its class
pub fn method_code(bytes: &[u8], name: &str) -> (Code, ClassModel) {
    let class = ClassModel::from_bytes(bytes).unwrap();
    let method = class
        .methods
        .iter()
        .find(|method| method.name.as_str() == name)
        .unwrap();
    let code = method.code(&class.class_file.constants).unwrap().unwrap();
    (code, class)
}

/// Rendered instructions of the named method
pub fn described(bytes: &[u8], name: &str) -> Vec<String> {
    let (code, class) = method_code(bytes, name);
    describe(&code, &class.class_file.constants)
}

/// Readable rendering of the instructions (labels and lines left out)
///
/// Member references come out as `invokestatic traces/Trace.onEntry`, jumps without their
/// targets.
pub fn describe(code: &Code, constants: &ConstantsPool) -> Vec<String> {
    code.nodes
        .iter()
        .filter_map(|node| match node {
            Node::Insn(insn) => Some(describe_insn(insn, constants)),
            Node::Branch(branch) => Some(describe_branch(branch)),
            Node::Label(_) | Node::Line(_) => None,
        })
        .collect()
}

fn describe_insn(insn: &Instruction, constants: &ConstantsPool) -> String {
    let field = |prefix: &str, index| {
        let field = constants.field_ref(index).unwrap();
        format!("{} {}.{}", prefix, field.owner.as_str(), field.name.as_str())
    };
    match insn {
        Instruction::Invoke(invoke, index) => {
            let method = constants.method_ref(*index).unwrap();
            let owner = match &method.owner {
                RefType::Object(name) => String::from(name.as_str()),
                other => format!("{:?}", other),
            };
            let prefix = match invoke {
                InvokeType::Static => "invokestatic",
                InvokeType::Special => "invokespecial",
                InvokeType::Virtual => "invokevirtual",
                InvokeType::Interface(_) => "invokeinterface",
            };
            format!("{} {}.{}", prefix, owner, method.name.as_str())
        }
        Instruction::GetStatic(index) => field("getstatic", *index),
        Instruction::PutStatic(index) => field("putstatic", *index),
        Instruction::GetField(index) => field("getfield", *index),
        Instruction::PutField(index) => field("putfield", *index),
        Instruction::Ldc(_) => String::from("ldc"),
        other => format!("{:?}", other),
    }
}

fn describe_branch(branch: &BranchInstruction<SynLabel, SynLabel>) -> String {
    match branch {
        BranchInstruction::If(op, _) => format!("If({:?})", op),
        BranchInstruction::IfICmp(op, _) => format!("IfICmp({:?})", op),
        BranchInstruction::Goto(_) => String::from("Goto"),
        other => format!("{:?}", other),
    }
}

/// Number of calls to handlers of the test trace
pub fn handler_calls(described: &[String]) -> usize {
    let prefix = format!("invokestatic {}.", TRACE);
    described.iter().filter(|insn| insn.starts_with(&prefix)).count()
}

pub fn count(described: &[String], insn: &str) -> usize {
    described.iter().filter(|described| *described == insn).count()
}

/// Instructions of the handler code an exception table entry jumps to, up to the first branch
pub fn handler_block(code: &Code, constants: &ConstantsPool, handler: SynLabel) -> Vec<String> {
    let start = code.label_positions()[&handler];
    let mut block = vec![];
    for node in &code.nodes[start..] {
        match node {
            Node::Insn(insn) => block.push(describe_insn(insn, constants)),
            Node::Branch(branch) => {
                block.push(describe_branch(branch));
                break;
            }
            Node::Label(_) | Node::Line(_) => (),
        }
    }
    block
}
