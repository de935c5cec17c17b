use crate::jvm::class_file::{
    self, AppliedTraces, Attribute, ClassFile, ConstantsPool, Method, RuntimeInvisibleAnnotations,
    RuntimeVisibleAnnotations, Serialize, Utf8ConstantIndex,
};
use crate::jvm::code::{decode, Code};
use crate::jvm::hierarchy::{ClassHierarchy, ClassInfo};
use crate::jvm::verifier::MethodContext;
use crate::jvm::{
    BinaryName, ClassAccessFlags, Error, FieldType, MethodAccessFlags, MethodDescriptor, Name,
    ParseDescriptor, RefType, RenderDescriptor, UnqualifiedName,
};

/// Class being transformed
///
/// One of these is built for every transformation and thrown away afterwards. The methods are
/// pulled out of the underlying class file so they can be rewritten one at a time, everything
/// else is carried through untouched.
pub struct ClassModel {
    /// Parsed class file (with `methods` moved into [`ClassModel::methods`])
    pub class_file: ClassFile,

    pub name: BinaryName,
    pub super_class: Option<BinaryName>,
    pub interfaces: Vec<BinaryName>,

    /// Types of the runtime visible and invisible annotations on the class
    pub annotations: Vec<BinaryName>,

    pub methods: Vec<MethodModel>,
}

/// Method of a class being transformed
pub struct MethodModel {
    /// Method as it will be written out
    pub raw: Method,

    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub annotations: Vec<BinaryName>,

    /// Has the `Code` attribute been replaced?
    pub modified: bool,
}

impl ClassModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<ClassModel, Error> {
        ClassModel::from_class_file(ClassFile::from_bytes(bytes)?)
    }

    pub fn from_class_file(mut class_file: ClassFile) -> Result<ClassModel, Error> {
        let (name, info) = ClassInfo::from_class_file(&class_file)?;
        let annotations = annotation_types(&class_file.attributes, &class_file.constants)?;
        let methods = std::mem::take(&mut class_file.methods)
            .into_iter()
            .map(|method| MethodModel::new(method, &class_file.constants))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(ClassModel {
            class_file,
            name,
            super_class: info.super_class,
            interfaces: info.interfaces,
            annotations,
            methods,
        })
    }

    pub fn is_interface(&self) -> bool {
        self.class_file
            .access_flags
            .contains(ClassAccessFlags::INTERFACE)
    }

    pub fn class_info(&self) -> ClassInfo {
        ClassInfo {
            super_class: self.super_class.clone(),
            interfaces: self.interfaces.clone(),
            is_interface: self.is_interface(),
        }
    }

    pub fn constants(&mut self) -> &mut ConstantsPool {
        &mut self.class_file.constants
    }

    /// Find a method by name and descriptor
    pub fn method_index(&self, name: &UnqualifiedName, descriptor: &MethodDescriptor<BinaryName>) -> Option<usize> {
        self.methods
            .iter()
            .position(|method| &method.name == name && &method.descriptor == descriptor)
    }

    /// Trace classes recorded as already applied to this class
    pub fn applied_traces(&self, attribute_name: &str) -> Result<Vec<BinaryName>, Error> {
        let constants = &self.class_file.constants;
        let mut traces = vec![];
        for attribute in &self.class_file.attributes {
            if attribute.name(constants) == Some(attribute_name) {
                for name in attribute.decode::<AppliedTraces>()?.0 {
                    traces.push(constants.binary_name(name)?);
                }
            }
        }
        Ok(traces)
    }

    /// Record the trace classes applied to this class, replacing any previous record
    pub fn set_applied_traces(&mut self, attribute_name: &str, traces: &[BinaryName]) -> Result<(), Error> {
        let constants = &mut self.class_file.constants;
        let names = traces
            .iter()
            .map(|trace| constants.get_utf8(trace.as_str()))
            .collect::<Result<Vec<Utf8ConstantIndex>, _>>()?;
        let name_index = constants.get_utf8(attribute_name)?;
        let mut info = vec![];
        AppliedTraces(names).serialize(&mut info)?;

        let constants = &self.class_file.constants;
        self.class_file
            .attributes
            .retain(|attribute| attribute.name(constants) != Some(attribute_name));
        self.class_file.attributes.push(Attribute { name_index, info });
        Ok(())
    }

    /// Append a method to the class
    pub fn add_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: UnqualifiedName,
        descriptor: MethodDescriptor<BinaryName>,
    ) -> Result<usize, Error> {
        let constants = &mut self.class_file.constants;
        let raw = Method {
            access_flags,
            name_index: constants.get_utf8(name.as_str())?,
            descriptor_index: constants.get_utf8(descriptor.render())?,
            attributes: vec![],
        };
        self.methods.push(MethodModel {
            raw,
            name,
            descriptor,
            annotations: vec![],
            modified: true,
        });
        Ok(self.methods.len() - 1)
    }

    /// Serialize the class, with all methods put back in
    pub fn into_bytes(mut self) -> Result<Vec<u8>, Error> {
        self.class_file.methods = self.methods.into_iter().map(|method| method.raw).collect();
        self.class_file.to_bytes()
    }
}

impl MethodModel {
    fn new(raw: Method, constants: &ConstantsPool) -> Result<MethodModel, Error> {
        Ok(MethodModel {
            name: constants.unqualified_name(raw.name_index)?,
            descriptor: constants.method_descriptor(raw.descriptor_index)?,
            annotations: annotation_types(&raw.attributes, constants)?,
            raw,
            modified: false,
        })
    }

    pub fn is_static(&self) -> bool {
        self.raw.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.raw.access_flags.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == UnqualifiedName::INIT
    }

    pub fn is_class_initializer(&self) -> bool {
        self.name == UnqualifiedName::CLINIT
    }

    /// Abstract and native methods have no code to rewrite
    pub fn has_code(&self) -> bool {
        !self
            .raw
            .access_flags
            .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE)
    }

    /// Method name and descriptor, as in `name(I)V`
    pub fn signature(&self) -> String {
        format!(
            "{}{}",
            self.name.as_str(),
            self.descriptor.render()
        )
    }

    /// What the verifier needs to know about this method
    pub fn context<'h>(&self, this_class: &BinaryName, hierarchy: &'h dyn ClassHierarchy) -> MethodContext<'h> {
        MethodContext {
            this_class: this_class.clone(),
            descriptor: self.descriptor.clone(),
            is_static: self.is_static(),
            is_constructor: self.is_constructor(),
            hierarchy,
        }
    }

    /// Raw `Code` attribute
    pub fn code_attribute(&self, constants: &ConstantsPool) -> Result<Option<class_file::Code>, Error> {
        for attribute in &self.raw.attributes {
            if attribute.is::<class_file::Code>(constants) {
                return attribute.decode::<class_file::Code>().map(Some);
            }
        }
        Ok(None)
    }

    /// Decoded method body
    pub fn code(&self, constants: &ConstantsPool) -> Result<Option<Code>, Error> {
        match self.code_attribute(constants)? {
            None => Ok(None),
            Some(attribute) => decode(&attribute, constants).map(Some),
        }
    }

    /// Replace (or add) the `Code` attribute
    pub fn set_code(&mut self, code: class_file::Code, constants: &mut ConstantsPool) -> Result<(), Error> {
        let attribute = constants.get_attribute(code)?;
        let name_index = attribute.name_index;
        match self
            .raw
            .attributes
            .iter_mut()
            .find(|existing| existing.name_index == name_index)
        {
            Some(existing) => *existing = attribute,
            None => self.raw.attributes.push(attribute),
        }
        self.modified = true;
        Ok(())
    }
}

/// Types of the annotations in `RuntimeVisibleAnnotations` and `RuntimeInvisibleAnnotations`
fn annotation_types(attributes: &[Attribute], constants: &ConstantsPool) -> Result<Vec<BinaryName>, Error> {
    let mut types = vec![];
    for attribute in attributes {
        let indices = if attribute.is::<RuntimeVisibleAnnotations>(constants) {
            attribute.decode::<RuntimeVisibleAnnotations>()?.0
        } else if attribute.is::<RuntimeInvisibleAnnotations>(constants) {
            attribute.decode::<RuntimeInvisibleAnnotations>()?.0
        } else {
            continue;
        };
        for index in indices {
            match FieldType::parse(constants.utf8(index)?) {
                Ok(FieldType::Ref(RefType::Object(class))) => types.push(class),
                _ => log::debug!("Ignoring annotation of unexpected type"),
            }
        }
    }
    Ok(types)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::Version;

    fn empty_class() -> ClassModel {
        let mut constants = ConstantsPool::new();
        let this_class = constants
            .get_class(&RefType::Object(BinaryName::from_string(String::from("app/Main")).unwrap()))
            .unwrap();
        let super_class = constants
            .get_class(&RefType::Object(BinaryName::OBJECT))
            .unwrap();
        ClassModel::from_class_file(ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        })
        .unwrap()
    }

    fn trace(name: &str) -> BinaryName {
        BinaryName::from_string(String::from(name)).unwrap()
    }

    #[test]
    fn applied_traces_survive_serialization() {
        let mut class = empty_class();
        assert!(class.applied_traces("Applied").unwrap().is_empty());

        class.set_applied_traces("Applied", &[trace("a/Trace")]).unwrap();
        class
            .set_applied_traces("Applied", &[trace("a/Trace"), trace("b/Trace")])
            .unwrap();
        assert_eq!(class.class_file.attributes.len(), 1);

        let class = ClassModel::from_bytes(&class.into_bytes().unwrap()).unwrap();
        assert_eq!(
            class.applied_traces("Applied").unwrap(),
            vec![trace("a/Trace"), trace("b/Trace")]
        );
        assert!(class.applied_traces("Other").unwrap().is_empty());
    }

    #[test]
    fn added_methods_are_written_out() {
        let mut class = empty_class();
        let no_args = MethodDescriptor {
            parameters: vec![],
            return_type: None,
        };
        let idx = class
            .add_method(MethodAccessFlags::STATIC, UnqualifiedName::CLINIT, no_args.clone())
            .unwrap();
        assert_eq!(class.method_index(&UnqualifiedName::CLINIT, &no_args), Some(idx));
        assert!(class.methods[idx].is_class_initializer());

        let class = ClassModel::from_bytes(&class.into_bytes().unwrap()).unwrap();
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].signature(), "<clinit>()V");
        assert!(class.methods[0].is_static());
    }
}
