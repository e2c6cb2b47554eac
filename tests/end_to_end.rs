//! End-to-end tests: a real server on a loopback socket, driven by the TCP
//! client.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gridline_modbus::{
    ExceptionCode, ModbusClient, ModbusError, ModbusTcpClient, ModbusTcpServer,
    ModbusTcpServerConfig, RegisterStore, StoreCapacity,
};

const UNIT_ID: u8 = 17;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Start a server on an ephemeral loopback port and connect a client to it.
async fn start_pair(capacity: StoreCapacity) -> (ModbusTcpServer, ModbusTcpClient) {
    init_tracing();

    let store = Arc::new(RegisterStore::with_capacity(capacity));
    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..ModbusTcpServerConfig::default()
    };
    let mut server = ModbusTcpServer::new(config, store);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = ModbusTcpClient::connect_with_timeout(&addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();
    (server, client)
}

fn small_capacity() -> StoreCapacity {
    StoreCapacity {
        coils: 500,
        discrete_inputs: 500,
        holding_registers: 500,
        input_registers: 500,
    }
}

#[tokio::test]
async fn coil_write_is_confirmed_and_readable() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    client.write_single_coil(UNIT_ID, 10, true).await.unwrap();
    assert_eq!(client.read_coils(UNIT_ID, 10, 1).await.unwrap(), vec![true]);

    client.write_single_coil(UNIT_ID, 10, false).await.unwrap();
    assert_eq!(
        client.read_coils(UNIT_ID, 10, 1).await.unwrap(),
        vec![false]
    );
}

#[tokio::test]
async fn register_block_round_trip() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    let values = vec![0x1234, 0x5678, 0x9ABC, 0xDEF0];
    client
        .write_multiple_registers(UNIT_ID, 100, &values)
        .await
        .unwrap();
    assert_eq!(
        client
            .read_holding_registers(UNIT_ID, 100, values.len() as u16)
            .await
            .unwrap(),
        values
    );

    client.write_single_register(UNIT_ID, 100, 0x0001).await.unwrap();
    assert_eq!(
        client.read_holding_registers(UNIT_ID, 100, 1).await.unwrap(),
        vec![0x0001]
    );
}

#[tokio::test]
async fn coil_block_round_trip() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    // An awkward bit count: partial trailing byte on the wire.
    let pattern: Vec<bool> = (0..19).map(|i| i % 3 == 0).collect();
    client
        .write_multiple_coils(UNIT_ID, 42, &pattern)
        .await
        .unwrap();
    assert_eq!(
        client
            .read_coils(UNIT_ID, 42, pattern.len() as u16)
            .await
            .unwrap(),
        pattern
    );
}

#[tokio::test]
async fn out_of_range_access_returns_exception() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    let err = client
        .read_holding_registers(UNIT_ID, 499, 2)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalDataAddress)
    );

    let err = client
        .write_multiple_registers(UNIT_ID, 498, &[1, 2, 3])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalDataAddress)
    );

    // The failed write must not have touched the leading registers.
    assert_eq!(
        client
            .read_holding_registers(UNIT_ID, 498, 2)
            .await
            .unwrap(),
        vec![0, 0]
    );
}

#[tokio::test]
async fn oversized_quantity_rejected_before_transmission() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    assert!(matches!(
        client.read_holding_registers(UNIT_ID, 0, 126).await,
        Err(ModbusError::InvalidRequest(_))
    ));
    assert!(matches!(
        client.read_coils(UNIT_ID, 0, 2001).await,
        Err(ModbusError::InvalidRequest(_))
    ));
    assert!(matches!(
        client.write_multiple_registers(UNIT_ID, 0, &[0; 124]).await,
        Err(ModbusError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn connection_survives_exception_replies() {
    let (_server, mut client) = start_pair(small_capacity()).await;

    for _ in 0..3 {
        let err = client
            .read_holding_registers(UNIT_ID, 499, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Exception(_)));
    }

    // Same connection still serves good requests.
    client.write_single_register(UNIT_ID, 7, 7).await.unwrap();
    assert_eq!(
        client.read_holding_registers(UNIT_ID, 7, 1).await.unwrap(),
        vec![7]
    );
}

#[tokio::test]
async fn two_clients_share_one_store() {
    let (_server, mut writer) = start_pair(small_capacity()).await;
    let addr = _server.local_addr().unwrap();
    let mut reader =
        ModbusTcpClient::connect_with_timeout(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();

    writer.write_single_register(UNIT_ID, 33, 0xCAFE).await.unwrap();
    assert_eq!(
        reader.read_holding_registers(UNIT_ID, 33, 1).await.unwrap(),
        vec![0xCAFE]
    );
}

/// Randomized sweep over a bounded window: every write is read back through
/// the wire and compared element-for-element.
#[tokio::test]
async fn randomized_write_read_sweep() {
    let (_server, mut client) = start_pair(small_capacity()).await;
    let mut rng = StdRng::seed_from_u64(0x4D42_5553);

    const WINDOW: u16 = 100;
    for _ in 0..50 {
        let count = rng.gen_range(1..=WINDOW / 2);
        let address = rng.gen_range(0..WINDOW - count);

        // Single coil.
        let bit = rng.gen_bool(0.5);
        client.write_single_coil(UNIT_ID, address, bit).await.unwrap();
        assert_eq!(
            client.read_coils(UNIT_ID, address, 1).await.unwrap(),
            vec![bit]
        );

        // Coil block.
        let bits: Vec<bool> = (0..count).map(|_| rng.gen_bool(0.5)).collect();
        client
            .write_multiple_coils(UNIT_ID, address, &bits)
            .await
            .unwrap();
        assert_eq!(
            client.read_coils(UNIT_ID, address, count).await.unwrap(),
            bits
        );

        // Single register.
        let word: u16 = rng.gen();
        client
            .write_single_register(UNIT_ID, address, word)
            .await
            .unwrap();
        assert_eq!(
            client
                .read_holding_registers(UNIT_ID, address, 1)
                .await
                .unwrap(),
            vec![word]
        );

        // Register block.
        let words: Vec<u16> = (0..count).map(|_| rng.gen()).collect();
        client
            .write_multiple_registers(UNIT_ID, address, &words)
            .await
            .unwrap();
        assert_eq!(
            client
                .read_holding_registers(UNIT_ID, address, count)
                .await
                .unwrap(),
            words
        );
    }
}

#[tokio::test]
async fn server_stop_closes_connections() {
    let (mut server, mut client) = start_pair(small_capacity()).await;

    client.write_single_register(UNIT_ID, 0, 1).await.unwrap();
    server.stop();

    // The connection dies either immediately or on the next request.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = client.read_holding_registers(UNIT_ID, 0, 1).await;
    assert!(result.is_err());
}
