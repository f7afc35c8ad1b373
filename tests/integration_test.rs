use anyhow::Result;
use onion_listener::{
    KeyRequest, ListenerPhase, OnionListener, OnionListenerOptions, TorAuthentication,
    TorControlConnection,
};

#[tokio::test]
#[ignore = "needs a tor daemon with its control port on 127.0.0.1:9051"]
async fn test_create_and_reuse_onion_key() -> Result<()> {
    let mut connection = TorControlConnection::connect("127.0.0.1:9051").await?;
    connection.authenticate(&TorAuthentication::Auto).await?;
    let onion_info = connection
        .add_onion(3000, "127.0.0.1:3000", &KeyRequest::Ed25519V3, false)
        .await?;
    let key = onion_info.private_key().cloned().expect("Tor returned no key");
    assert_eq!(Some(onion_info.service_id().clone()), key.service_id()?);
    connection.delete_onion(onion_info.service_id()).await?;

    let reused = connection
        .add_onion(3000, "127.0.0.1:3000", &KeyRequest::PrivateKey(key), false)
        .await?;
    assert_eq!(onion_info.service_id(), reused.service_id());
    connection.delete_onion(reused.service_id()).await?;

    Ok(())
}

#[tokio::test]
#[ignore = "needs a tor daemon with its control port on 127.0.0.1:9051"]
async fn test_onion_listener_lifecycle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = OnionListenerOptions::new(80, "127.0.0.1:18080", "tcp", "127.0.0.1:9051")
        .with_key_file(dir.path().join("onion_key"));
    let mut listener = OnionListener::bind(options).await?;
    assert_eq!(ListenerPhase::Listening, listener.phase());
    assert!(listener.address()?.to_string().ends_with(".onion:80"));
    listener.close().await?;
    assert_eq!(ListenerPhase::Closed, listener.phase());

    Ok(())
}
