use folio::config::{Config, Profile, Provider};

// Both cases mutate process env, so they run as one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("FOLIO_API_KEY");
        std::env::remove_var("FOLIO_PROVIDER");
        std::env::remove_var("FOLIO_MODEL");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("FOLIO_API_KEY", "test-key");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.provider, Provider::Gemini);
    assert_eq!(config.model, Provider::Gemini.default_model());
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("FOLIO_PROVIDER", "Anthropic");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.provider, Provider::Anthropic);
    assert_eq!(config.model, Provider::Anthropic.default_model());

    unsafe {
        std::env::set_var("FOLIO_PROVIDER", "openai");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("FOLIO_API_KEY");
        std::env::remove_var("FOLIO_PROVIDER");
    }
}

#[test]
fn profile_loads_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("album.toml");
    std::fs::write(
        &path,
        "model = \"gemini-2.5-pro\"\ninstructions = \"Translate to English.\"\n",
    )
    .unwrap();

    let profile = Profile::load(&path).unwrap();
    assert_eq!(profile.model.as_deref(), Some("gemini-2.5-pro"));
    assert_eq!(profile.instructions.as_deref(), Some("Translate to English."));
}

#[test]
fn profile_rejects_bad_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "model = ").unwrap();
    assert!(Profile::load(&path).is_err());
}
