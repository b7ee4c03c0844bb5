pub mod webhook_parsing;
