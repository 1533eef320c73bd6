pub mod mock_runtime;
