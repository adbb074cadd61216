use async_trait::async_trait;
use fixture::{FakeRfkill, FakeTechDevice, MemorySettings};
use modemd::{
    error::{Error, Result},
    technology::{
        DeviceBinding, PowerOutcome, RfkillSwitch, TechnologyDriver, TechnologyEvent,
        TechnologyManager, TechnologyProperty, TechnologyType, Toggle,
    },
};
use std::sync::{Arc, Mutex};

mod fixture;

struct TestDriver {
    name: &'static str,
    kind: TechnologyType,
    tethering: Mutex<Vec<(Option<String>, Option<String>, String, bool)>>,
}

impl TestDriver {
    fn new(name: &'static str, kind: TechnologyType) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            tethering: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TechnologyDriver for TestDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> TechnologyType {
        self.kind
    }

    async fn set_tethering(
        &self,
        _kind: TechnologyType,
        identifier: Option<&str>,
        passphrase: Option<&str>,
        bridge: &str,
        enabled: bool,
    ) -> Result<Toggle> {
        self.tethering.lock().unwrap().push((
            identifier.map(str::to_string),
            passphrase.map(str::to_string),
            bridge.to_string(),
            enabled,
        ));

        Ok(Toggle::Done)
    }
}

struct Techs {
    manager: TechnologyManager,
    settings: Arc<MemorySettings>,
    rfkill: Arc<FakeRfkill>,
}

async fn techs_with(settings: MemorySettings, bridge: Option<&str>) -> Techs {
    let settings = Arc::new(settings);
    let rfkill = Arc::new(FakeRfkill::default());
    let manager = TechnologyManager::builder()
        .settings(settings.clone())
        .rfkill(rfkill.clone())
        .maybe_tethering_bridge(bridge.map(str::to_string))
        .init()
        .await;

    Techs {
        manager,
        settings,
        rfkill,
    }
}

async fn techs() -> Techs {
    techs_with(MemorySettings::default(), None).await
}

fn switch(index: u32, softblocked: bool, hardblocked: bool) -> RfkillSwitch {
    RfkillSwitch {
        index,
        kind: TechnologyType::Wifi,
        softblocked,
        hardblocked,
    }
}

#[tokio::test]
async fn it_parks_devices_until_a_driver_registers() {
    // Arrange
    let t = techs().await;
    let device = FakeTechDevice::new("wlan0", TechnologyType::Wifi);

    // Act
    let binding = t.manager.add_device(device).await.unwrap();

    // Assert
    assert_eq!(binding, DeviceBinding::Parked);
    assert!(t.manager.list().await.is_empty());

    // Act
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;

    // Assert
    let info = t.manager.info(TechnologyType::Wifi).await.unwrap();
    assert_eq!(info.devices, 1);
    assert_eq!(info.name, "WiFi");
    let added = t.manager.events().try_iter().any(
        |e| matches!(e, TechnologyEvent::Added(info) if info.kind == TechnologyType::Wifi),
    );
    assert!(added);
}

#[tokio::test]
async fn it_needs_a_driver_to_create_a_technology() {
    // Arrange
    let t = techs().await;

    // Act
    let result = t.manager.get_or_create(TechnologyType::Gps).await;

    // Assert
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn it_enables_wired_devices_by_default() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("ethernet", TechnologyType::Ethernet))
        .await;
    let device = FakeTechDevice::new("eth0", TechnologyType::Ethernet);

    // Act
    t.manager.add_device(device.clone()).await.unwrap();

    // Assert
    assert_eq!(device.toggles(), vec![true]);
    assert!(t.manager.info(TechnologyType::Ethernet).await.unwrap().powered);
    assert_eq!(t.settings.get_bool("Wired", "Enable"), Some(true));
}

#[tokio::test]
async fn it_persists_the_power_choice() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    t.manager.add_device(device.clone()).await.unwrap();

    // Act
    let outcome = t
        .manager
        .set_powered(TechnologyType::Cellular, true)
        .await
        .unwrap();

    // Assert
    assert!(matches!(outcome, PowerOutcome::Done));
    assert!(device.is_powered_now());
    assert_eq!(t.settings.get_bool("Cellular", "Enable"), Some(true));
    let info = t.manager.info(TechnologyType::Cellular).await.unwrap();
    assert!(info.powered);
    assert!(info.enable_persistent);
    assert_eq!(
        t.manager.set_powered(TechnologyType::Cellular, true).await.err(),
        Some(Error::AlreadyEnabled)
    );
}

#[tokio::test]
async fn it_restores_the_persisted_power_choice() {
    // Arrange
    let t = techs_with(MemorySettings::with("[Cellular]\nEnable=true\n"), None).await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);

    // Act
    t.manager.add_device(device.clone()).await.unwrap();

    // Assert
    assert_eq!(device.toggles(), vec![true]);
    assert!(t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
}

#[tokio::test]
async fn it_resolves_in_progress_power_requests_on_notification() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    t.manager.add_device(device.clone()).await.unwrap();
    device.answer(Ok(Toggle::InProgress));

    // Act
    let outcome = t
        .manager
        .set_powered(TechnologyType::Cellular, true)
        .await
        .unwrap();
    let busy = t.manager.set_powered(TechnologyType::Cellular, true).await;
    t.manager
        .notify_powered(TechnologyType::Cellular, true)
        .await
        .unwrap();

    // Assert
    let PowerOutcome::InProgress(request) = outcome else {
        panic!("expected an in-progress request");
    };
    assert_eq!(busy.err(), Some(Error::Busy));
    assert_eq!(request.wait().await, Ok(()));
    assert!(t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
}

#[tokio::test(start_paused = true)]
async fn it_times_out_power_requests_nobody_answers() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    t.manager.add_device(device.clone()).await.unwrap();
    device.answer(Ok(Toggle::InProgress));

    // Act
    let outcome = t
        .manager
        .set_powered(TechnologyType::Cellular, true)
        .await
        .unwrap();

    // Assert
    let PowerOutcome::InProgress(request) = outcome else {
        panic!("expected an in-progress request");
    };
    assert_eq!(request.wait().await, Err(Error::Timeout));
    assert!(!t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
}

#[tokio::test]
async fn it_only_counts_as_disabled_once_no_device_is_powered() {
    // Arrange
    let t = techs_with(MemorySettings::with("[Cellular]\nEnable=true\n"), None).await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let first = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    let second = FakeTechDevice::new("/dev/cdc-wdm1", TechnologyType::Cellular);
    t.manager.add_device(first.clone()).await.unwrap();
    t.manager.add_device(second.clone()).await.unwrap();

    // Act
    first.set_powered_now(false);
    t.manager
        .notify_powered(TechnologyType::Cellular, false)
        .await
        .unwrap();

    // Assert
    assert!(t.manager.info(TechnologyType::Cellular).await.unwrap().powered);

    // Act
    second.set_powered_now(false);
    t.manager
        .notify_powered(TechnologyType::Cellular, false)
        .await
        .unwrap();

    // Assert
    assert!(!t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
}

#[tokio::test]
async fn it_hides_hardblocked_technologies() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;

    // Act
    t.manager.add_rfkill(switch(0, false, true)).await.unwrap();

    // Assert
    assert!(t.manager.list().await.is_empty());
    assert_eq!(
        t.manager.set_powered(TechnologyType::Wifi, true).await.err(),
        Some(Error::AccessDenied)
    );
    assert_ne!(t.settings.get_bool("WiFi", "Enable"), Some(true));

    // Act
    t.manager.update_rfkill(switch(0, false, false)).await.unwrap();

    // Assert
    let listed = t.manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].kind, TechnologyType::Wifi);
    assert!(!listed[0].hardblocked);
}

#[tokio::test]
async fn it_needs_every_switch_to_agree_before_lifting_a_hardblock() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;
    t.manager.add_rfkill(switch(0, false, true)).await.unwrap();
    t.manager.add_rfkill(switch(1, false, true)).await.unwrap();

    // Act
    t.manager.update_rfkill(switch(0, false, false)).await.unwrap();

    // Assert
    let info = t.manager.info(TechnologyType::Wifi).await.unwrap();
    assert!(info.hardblocked);

    // Act
    t.manager.update_rfkill(switch(1, false, false)).await.unwrap();

    // Assert
    let info = t.manager.info(TechnologyType::Wifi).await.unwrap();
    assert!(!info.hardblocked);
    assert!(info.registered);
}

#[tokio::test]
async fn it_softblocks_radios_the_user_disabled() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;

    // Act
    t.manager.add_rfkill(switch(0, false, false)).await.unwrap();

    // Assert
    assert_eq!(t.rfkill.calls(), vec![(TechnologyType::Wifi, true)]);
}

#[tokio::test]
async fn it_unblocks_radios_persisted_as_enabled() {
    // Arrange
    let t = techs_with(MemorySettings::with("[WiFi]\nEnable=true\n"), None).await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;

    // Act
    t.manager.add_rfkill(switch(0, true, false)).await.unwrap();

    // Assert
    assert_eq!(t.rfkill.calls(), vec![(TechnologyType::Wifi, false)]);
}

#[tokio::test]
async fn it_follows_switch_events_for_rfkill_driven_technologies() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;
    t.manager.add_rfkill(switch(0, true, false)).await.unwrap();

    // Act
    let outcome = t.manager.set_powered(TechnologyType::Wifi, true).await.unwrap();

    // Assert
    assert!(matches!(outcome, PowerOutcome::Done));
    assert!(t.rfkill.calls().contains(&(TechnologyType::Wifi, false)));
    assert!(!t.manager.info(TechnologyType::Wifi).await.unwrap().powered);

    // Act
    t.manager.update_rfkill(switch(0, false, false)).await.unwrap();

    // Assert
    assert!(t.manager.info(TechnologyType::Wifi).await.unwrap().powered);
}

#[tokio::test]
async fn it_destroys_technologies_with_their_last_device() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    t.manager.add_device(device).await.unwrap();
    let events = t.manager.events();
    events.drain().for_each(drop);

    // Act
    t.manager.remove_device("/dev/cdc-wdm0").await.unwrap();

    // Assert
    assert_eq!(t.manager.info(TechnologyType::Cellular).await, None);
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![TechnologyEvent::Removed(TechnologyType::Cellular)]
    );
    assert!(matches!(
        t.manager.remove_device("/dev/cdc-wdm0").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn it_toggles_everything_for_offline_mode() {
    // Arrange
    let t = techs_with(MemorySettings::with("[Cellular]\nEnable=true\n"), None).await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);
    t.manager.add_device(device.clone()).await.unwrap();

    // Act
    t.manager.set_offline_mode(true).await.unwrap();

    // Assert
    assert!(t.manager.offline_mode().await);
    assert!(!t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
    assert_eq!(t.settings.get_bool("global", "OfflineMode"), Some(true));

    // Act
    t.manager.set_offline_mode(false).await.unwrap();

    // Assert
    assert!(t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
    assert_eq!(device.toggles(), vec![true, false, true]);
    assert_eq!(t.settings.get_bool("global", "OfflineMode"), Some(false));
}

#[tokio::test]
async fn it_restores_offline_mode_on_startup() {
    // Arrange
    let settings = MemorySettings::with("[global]\nOfflineMode=true\n");

    // Act
    let t = techs_with(settings, None).await;

    // Assert
    assert!(t.manager.offline_mode().await);
}

#[tokio::test]
async fn it_keeps_devices_off_while_offline() {
    // Arrange
    let settings = MemorySettings::with("[global]\nOfflineMode=true\n[Cellular]\nEnable=true\n");
    let t = techs_with(settings, None).await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    let device = FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular);

    // Act
    t.manager.add_device(device.clone()).await.unwrap();

    // Assert
    assert!(device.toggles().is_empty());
    assert!(!t.manager.info(TechnologyType::Cellular).await.unwrap().powered);
}

#[tokio::test]
async fn it_reports_connectivity_changes() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("cellular", TechnologyType::Cellular))
        .await;
    t.manager
        .add_device(FakeTechDevice::new("/dev/cdc-wdm0", TechnologyType::Cellular))
        .await
        .unwrap();
    let events = t.manager.events();
    events.drain().for_each(drop);

    // Act
    t.manager
        .set_connected(TechnologyType::Cellular, true)
        .await
        .unwrap();
    t.manager
        .set_connected(TechnologyType::Cellular, true)
        .await
        .unwrap();

    // Assert
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![TechnologyEvent::Changed {
            kind: TechnologyType::Cellular,
            property: TechnologyProperty::Connected(true),
        }]
    );
}

#[tokio::test]
async fn it_validates_tethering_settings() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;
    t.manager
        .add_device(FakeTechDevice::new("wlan0", TechnologyType::Wifi))
        .await
        .unwrap();
    let long = "x".repeat(33);

    // Act & Assert
    assert!(matches!(
        t.manager
            .set_tethering_identifier(TechnologyType::Wifi, &long)
            .await,
        Err(Error::InvalidArguments(_))
    ));
    assert_eq!(
        t.manager
            .set_tethering_passphrase(TechnologyType::Wifi, "short")
            .await,
        Err(Error::PassphraseRequired)
    );
    assert_eq!(
        t.manager
            .set_tethering_identifier(TechnologyType::Cellular, "modemd")
            .await,
        Err(Error::NotSupported)
    );

    t.manager
        .set_tethering_identifier(TechnologyType::Wifi, "modemd")
        .await
        .unwrap();
    assert_eq!(
        t.settings.get_string("WiFi", "Tethering.Identifier").as_deref(),
        Some("modemd")
    );
}

#[tokio::test]
async fn it_requires_a_powered_technology_and_a_bridge_for_tethering() {
    // Arrange
    let t = techs().await;
    t.manager
        .register_driver(TestDriver::new("wifi", TechnologyType::Wifi))
        .await;
    t.manager
        .add_device(FakeTechDevice::new("wlan0", TechnologyType::Wifi))
        .await
        .unwrap();

    // Act
    let unpowered = t.manager.set_tethering(TechnologyType::Wifi, true).await;
    t.manager
        .set_powered(TechnologyType::Wifi, true)
        .await
        .unwrap();
    let no_bridge = t.manager.set_tethering(TechnologyType::Wifi, true).await;

    // Assert
    assert_eq!(unpowered, Err(Error::AccessDenied));
    assert_eq!(no_bridge, Err(Error::NotSupported));
}

#[tokio::test]
async fn it_enables_tethering_through_the_driver() {
    // Arrange
    let t = techs_with(MemorySettings::default(), Some("tether")).await;
    let driver = TestDriver::new("wifi", TechnologyType::Wifi);
    t.manager.register_driver(driver.clone()).await;
    t.manager
        .add_device(FakeTechDevice::new("wlan0", TechnologyType::Wifi))
        .await
        .unwrap();
    t.manager
        .set_powered(TechnologyType::Wifi, true)
        .await
        .unwrap();

    // Act
    let incomplete = t.manager.set_tethering(TechnologyType::Wifi, true).await;
    t.manager
        .set_tethering_identifier(TechnologyType::Wifi, "modemd")
        .await
        .unwrap();
    t.manager
        .set_tethering_passphrase(TechnologyType::Wifi, "correct horse")
        .await
        .unwrap();
    let enabled = t.manager.set_tethering(TechnologyType::Wifi, true).await;
    let again = t.manager.set_tethering(TechnologyType::Wifi, true).await;

    // Assert
    assert!(matches!(incomplete, Err(Error::InvalidArguments(_))));
    assert_eq!(enabled, Ok(Toggle::Done));
    assert_eq!(again, Err(Error::AlreadyEnabled));
    assert!(t.manager.info(TechnologyType::Wifi).await.unwrap().tethering);
    assert_eq!(
        *driver.tethering.lock().unwrap(),
        vec![(
            Some("modemd".to_string()),
            Some("correct horse".to_string()),
            "tether".to_string(),
            true
        )]
    );
}

#[tokio::test]
async fn it_stops_tethering_when_the_technology_is_disabled() {
    // Arrange
    let t = techs_with(MemorySettings::default(), Some("tether")).await;
    t.manager
        .register_driver(TestDriver::new("bluetooth", TechnologyType::Bluetooth))
        .await;
    t.manager
        .add_device(FakeTechDevice::new("hci0", TechnologyType::Bluetooth))
        .await
        .unwrap();
    t.manager
        .set_powered(TechnologyType::Bluetooth, true)
        .await
        .unwrap();
    t.manager
        .set_tethering(TechnologyType::Bluetooth, true)
        .await
        .unwrap();

    // Act
    t.manager
        .set_powered(TechnologyType::Bluetooth, false)
        .await
        .unwrap();

    // Assert
    let info = t.manager.info(TechnologyType::Bluetooth).await.unwrap();
    assert!(!info.tethering);
    assert!(!info.powered);
}
