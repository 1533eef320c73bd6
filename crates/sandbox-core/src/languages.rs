//! Language runtime registry
//!
//! Maps each supported language to the runner image that executes it and the
//! command used inside the container. Interpreted languages receive the
//! source as the final argv element. Compiled languages run a shell
//! expression that writes the source from `SANDBOX_SOURCE` into the scratch
//! directory, builds it with stdin redirected from `/dev/null`, and then runs
//! the program, so caller stdin only ever reaches the final run step.

use std::collections::HashMap;

use crate::model::Language;

/// Environment variable carrying the source into compile-and-run containers.
pub const SOURCE_ENV_VAR: &str = "SANDBOX_SOURCE";

/// Writable scratch directory inside the container, also its working dir.
pub const SCRATCH_DIR: &str = "/sandbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRuntime {
    pub image: String,
    pub command: Vec<String>,
    pub compile: Option<String>,
    pub file_extension: &'static str,
    /// The built program lives in the scratch mount, which must then allow exec.
    pub executable_scratch: bool,
}

impl LanguageRuntime {
    fn interpreted(image: &str, command: &[&str], file_extension: &'static str) -> Self {
        Self {
            image: image.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            compile: None,
            file_extension,
            executable_scratch: false,
        }
    }

    fn compiled(
        image: &str,
        source_stem: &str,
        file_extension: &'static str,
        build: &str,
        run: &str,
        executable_scratch: bool,
    ) -> Self {
        let source = format!("{}/{}{}", SCRATCH_DIR, source_stem, file_extension);
        let compile = format!(
            "printf '%s' \"${env}\" > {source} && {build} < /dev/null && {run}",
            env = SOURCE_ENV_VAR,
            source = source,
            build = build.replace("{source}", &source),
            run = run,
        );
        Self {
            image: image.to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string()],
            compile: Some(compile),
            file_extension,
            executable_scratch,
        }
    }

    /// Container argv for this runtime and the given source.
    pub fn build_command(&self, code: &str) -> Vec<String> {
        let mut cmd = self.command.clone();
        match &self.compile {
            Some(expr) => cmd.push(expr.clone()),
            None => cmd.push(code.to_string()),
        }
        cmd
    }

    /// Environment for the container. Only compiled languages need the source there.
    pub fn build_env(&self, code: &str) -> Vec<String> {
        match self.compile {
            Some(_) => vec![format!("{}={}", SOURCE_ENV_VAR, code)],
            None => Vec::new(),
        }
    }
}

/// Immutable table of language runtimes, built once at startup.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    runtimes: HashMap<Language, LanguageRuntime>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        let mut runtimes = HashMap::new();
        runtimes.insert(
            Language::Python,
            LanguageRuntime::interpreted("sandbox-python-runner:latest", &["python3", "-c"], ".py"),
        );
        runtimes.insert(
            Language::Javascript,
            LanguageRuntime::interpreted("sandbox-node-runner:latest", &["node", "-e"], ".js"),
        );
        runtimes.insert(
            Language::Cpp,
            LanguageRuntime::compiled(
                "sandbox-cpp-runner:latest",
                "code",
                ".cpp",
                "g++ -O2 -o /sandbox/program {source}",
                "/sandbox/program",
                true,
            ),
        );
        runtimes.insert(
            Language::Java,
            LanguageRuntime::compiled(
                "sandbox-java-runner:latest",
                "Main",
                ".java",
                "javac -d /sandbox {source}",
                "java -cp /sandbox Main",
                false,
            ),
        );
        runtimes.insert(
            Language::Go,
            LanguageRuntime::compiled(
                "sandbox-go-runner:latest",
                "main",
                ".go",
                "GOCACHE=/tmp/gocache go build -o /sandbox/program {source}",
                "/sandbox/program",
                true,
            ),
        );
        Self { runtimes }
    }
}

impl LanguageRegistry {
    pub fn get(&self, language: Language) -> Option<&LanguageRuntime> {
        self.runtimes.get(&language)
    }

    /// Languages with a runtime, in a stable order.
    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .iter()
            .copied()
            .filter(|lang| self.runtimes.contains_key(lang))
            .collect()
    }

    /// Distinct runner images referenced by the registry.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .languages()
            .into_iter()
            .filter_map(|lang| self.get(lang).map(|rt| rt.image.clone()))
            .collect();
        images.sort();
        images.dedup();
        images
    }

    pub fn without(mut self, language: Language) -> Self {
        self.runtimes.remove(&language);
        self
    }

    pub fn with_image(mut self, language: Language, image: impl Into<String>) -> Self {
        if let Some(runtime) = self.runtimes.get_mut(&language) {
            runtime.image = image.into();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreted_command_appends_code() {
        let registry = LanguageRegistry::default();
        let python = registry.get(Language::Python).unwrap();
        assert_eq!(
            python.build_command("print('hi')"),
            vec!["python3", "-c", "print('hi')"]
        );
        assert!(python.build_env("print('hi')").is_empty());
    }

    #[test]
    fn test_compiled_command_is_shell_wrapped() {
        let registry = LanguageRegistry::default();
        let cpp = registry.get(Language::Cpp).unwrap();
        let cmd = cpp.build_command("int main(){}");

        assert_eq!(cmd.len(), 3);
        assert_eq!(&cmd[..2], &["/bin/sh", "-c"]);
        assert_eq!(
            cmd[2],
            "printf '%s' \"$SANDBOX_SOURCE\" > /sandbox/code.cpp && \
             g++ -O2 -o /sandbox/program /sandbox/code.cpp < /dev/null && /sandbox/program"
        );
        assert!(!cmd[2].contains("int main"));
        assert_eq!(cpp.build_env("int main(){}"), vec!["SANDBOX_SOURCE=int main(){}"]);
    }

    #[test]
    fn test_stdin_only_reaches_run_step() {
        let registry = LanguageRegistry::default();
        for lang in [Language::Cpp, Language::Java, Language::Go] {
            let expr = registry.get(lang).unwrap().compile.clone().unwrap();
            let steps: Vec<&str> = expr.split(" && ").collect();
            assert_eq!(steps.len(), 3, "{}", expr);
            assert!(steps[1].ends_with("< /dev/null"), "build step of {}", lang);
            assert!(!steps[2].contains("/dev/null"), "run step of {}", lang);
        }
    }

    #[test]
    fn test_java_source_is_named_main() {
        let registry = LanguageRegistry::default();
        let java = registry.get(Language::Java).unwrap();
        assert!(java.compile.as_ref().unwrap().contains("/sandbox/Main.java"));
        assert!(!java.executable_scratch);
    }

    #[test]
    fn test_registry_overrides() {
        let registry = LanguageRegistry::default()
            .without(Language::Go)
            .with_image(Language::Python, "custom/python:3.12");

        assert!(registry.get(Language::Go).is_none());
        assert_eq!(registry.get(Language::Python).unwrap().image, "custom/python:3.12");
        assert_eq!(
            registry.languages(),
            vec![Language::Python, Language::Javascript, Language::Cpp, Language::Java]
        );
        assert_eq!(registry.images().len(), 4);
    }
}
