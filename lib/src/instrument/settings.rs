use super::gates::{LevelSource, SamplingService};
use super::Error;
use crate::jvm::{BinaryName, Name, UnqualifiedName};

pub struct Settings {
    /// Runtime class, written as `my/runtime/Klass`
    ///
    /// Classes matched through a supertype get a call to its static
    /// `retransform(Ljava/lang/String;Ljava/lang/Class;)V` in their `<clinit>`.
    pub runtime_class: BinaryName,

    /// Class with the static sampling methods (`hit`, `hitTimed`, `hitAdaptive`, `getEndTs`,
    /// `updateEndTs`)
    pub tracker_class: BinaryName,

    /// Name of the static `int` field on each trace class holding its current level
    pub level_field_name: UnqualifiedName,

    /// Prefix of members generated by the tracing machinery
    ///
    /// Methods starting with this prefix are never instrumented.
    pub injected_prefix: String,

    /// Name of the class attribute recording which traces have been applied
    ///
    /// The JVM ignores attributes it doesn't know about, so this has no runtime effect.
    pub applied_attribute_name: String,

    /// Add `LocalVariableTable` entries for the locals introduced by instrumentation
    ///
    /// Only done for methods which already have a `LocalVariableTable`.
    pub emit_local_variable_entries: bool,

    /// Re-parse and re-analyze the whole transformed class before accepting it
    ///
    /// Every rewritten method is type-checked while it is being encoded regardless. This is the
    /// extra end-to-end check that the class as serialized is what was verified.
    pub verify: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            runtime_class: BinaryName::TRACERUNTIME,
            tracker_class: BinaryName::METHODTRACKER,
            level_field_name: UnqualifiedName::TRACELEVEL,
            injected_prefix: String::from("$btrace$"),
            applied_attribute_name: String::from("BTraceApplied"),
            emit_local_variable_entries: true,
            verify: true,
        }
    }
}

impl Settings {
    /// Make settings with custom runtime class names
    pub fn new(
        runtime_class: impl Into<String>,
        tracker_class: impl Into<String>,
        level_field_name: impl Into<String>,
    ) -> Result<Settings, Error> {
        fn make_name<N: Name>(name: impl Into<String>) -> Result<N, Error> {
            N::from_string(name.into()).map_err(Error::Settings)
        }

        let settings = Settings {
            runtime_class: make_name(runtime_class)?,
            tracker_class: make_name(tracker_class)?,
            level_field_name: make_name(level_field_name)?,
            ..Settings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check that the free-form settings are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.injected_prefix.is_empty() {
            return Err(Error::Settings(String::from("injected prefix is empty")));
        }
        UnqualifiedName::check_valid(&self.injected_prefix).map_err(Error::Settings)?;
        if self.applied_attribute_name.is_empty() {
            return Err(Error::Settings(String::from(
                "applied attribute name is empty",
            )));
        }
        Ok(())
    }

    /// How trace levels are read
    pub fn level_source(&self) -> LevelSource {
        LevelSource {
            field_name: self.level_field_name.clone(),
        }
    }

    /// How the sampling counters are called
    pub fn sampling_service(&self) -> SamplingService {
        SamplingService {
            tracker_class: self.tracker_class.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn custom_names_are_validated() {
        let settings = Settings::new("org/acme/Runtime", "org/acme/Tracker", "level").unwrap();
        assert_eq!(settings.runtime_class.as_str(), "org/acme/Runtime");
        assert_eq!(settings.level_source().field_name.as_str(), "level");

        assert!(matches!(
            Settings::new("org.acme.Runtime", "org/acme/Tracker", "level"),
            Err(Error::Settings(_))
        ));
        assert!(matches!(
            Settings::new("org/acme/Runtime", "org/acme/Tracker", "a/b"),
            Err(Error::Settings(_))
        ));

        let settings = Settings {
            injected_prefix: String::from("bad.prefix"),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }
}
